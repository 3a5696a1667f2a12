//! Common test utilities: an in-memory SD card

#![allow(dead_code)]

use std::cell::{Cell, RefCell};

use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx};
use sdcard_utils::{DirEntry, FatType, SdCardUtils, SdConfig, format, format_as};

/// 16 MiB, formats as FAT16
pub const DISK_BLOCKS: usize = 32_768;

/// 40 MiB, enough clusters for FAT32
pub const FAT32_DISK_BLOCKS: usize = 81_920;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamDiskError {
    Removed,
    OutOfRange,
}

/// Block device backed by RAM, with a switch that simulates pulling the card
pub struct RamDisk {
    blocks: RefCell<Vec<Block>>,
    removed: Cell<bool>,
}

impl RamDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: RefCell::new(vec![Block::new(); num_blocks]),
            removed: Cell::new(false),
        }
    }

    /// Every further access fails with `RamDiskError::Removed`
    pub fn remove(&self) {
        self.removed.set(true);
    }

    pub fn reinsert(&self) {
        self.removed.set(false);
    }

    pub fn block(&self, idx: usize) -> Block {
        self.blocks.borrow()[idx].clone()
    }

    /// Overwrite the 11-byte short name of every directory entry called
    /// `from`, the way another OS might have written it. Returns the count.
    pub fn rename_raw(&self, from: &[u8; 11], to: &[u8; 11]) -> usize {
        let mut hits = 0;
        for block in self.blocks.borrow_mut().iter_mut() {
            for entry in block.chunks_exact_mut(32) {
                if &entry[..11] == from {
                    entry[..11].copy_from_slice(to);
                    hits += 1;
                }
            }
        }
        hits
    }

    /// Free cluster count recorded in the FAT32 FSInfo sector.
    pub fn fsinfo_free_count(&self) -> u32 {
        let mbr = self.block(0);
        let start = u32::from_le_bytes(mbr[446 + 8..446 + 12].try_into().unwrap()) as usize;
        let info = self.block(start + 1);
        assert_eq!(&info[..4], b"RRaA", "no FSInfo sector");
        u32::from_le_bytes(info[488..492].try_into().unwrap())
    }

    fn check(&self, start: BlockIdx, count: usize) -> Result<usize, RamDiskError> {
        if self.removed.get() {
            return Err(RamDiskError::Removed);
        }
        let start = start.0 as usize;
        if start + count > self.blocks.borrow().len() {
            return Err(RamDiskError::OutOfRange);
        }
        Ok(start)
    }
}

impl BlockDevice for RamDisk {
    type Error = RamDiskError;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let start = self.check(start_block_idx, blocks.len())?;
        let disk = self.blocks.borrow();
        blocks.clone_from_slice(&disk[start..start + blocks.len()]);
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let start = self.check(start_block_idx, blocks.len())?;
        let mut disk = self.blocks.borrow_mut();
        disk[start..start + blocks.len()].clone_from_slice(blocks);
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        if self.removed.get() {
            return Err(RamDiskError::Removed);
        }
        Ok(BlockCount(self.blocks.borrow().len() as u32))
    }
}

/// A fresh FAT16 card
pub fn formatted_disk() -> RamDisk {
    let disk = RamDisk::new(DISK_BLOCKS);
    format(&disk, "TEST").expect("format");
    disk
}

/// A fresh FAT16 card, mounted at /sd
pub fn mounted() -> SdCardUtils<RamDisk> {
    SdCardUtils::mount(formatted_disk(), &SdConfig::defaults()).expect("mount")
}

/// A fresh FAT32 card, mounted at /sd
pub fn mounted_fat32() -> SdCardUtils<RamDisk> {
    let disk = RamDisk::new(FAT32_DISK_BLOCKS);
    format_as(&disk, FatType::Fat32, "TEST32").expect("format");
    SdCardUtils::mount(disk, &SdConfig::defaults()).expect("mount")
}

/// Write 1 MiB files until the card refuses. Returns how many fit and
/// the error that stopped it.
pub fn fill(sd: &SdCardUtils<RamDisk>) -> (usize, sdcard_utils::Error<RamDiskError>) {
    let chunk = vec![0xA5u8; 1 << 20];
    for i in 0..100 {
        if let Err(e) = sd.write_file(&format!("F{:02}.DAT", i), &chunk) {
            return (i, e);
        }
    }
    panic!("card never filled up");
}

/// Entry names of `path`, in directory order
pub fn names(sd: &SdCardUtils<RamDisk>, path: &str) -> Vec<String> {
    let mut out = Vec::new();
    sd.for_each_entry(path, |e: &DirEntry| out.push(e.name().to_string()))
        .expect("list");
    out
}

pub fn read_all(sd: &SdCardUtils<RamDisk>, path: &str) -> Vec<u8> {
    let mut buf = vec![0u8; sd.file_size(path).expect("size") as usize];
    let n = sd.read_file(path, &mut buf).expect("read");
    buf.truncate(n);
    buf
}
