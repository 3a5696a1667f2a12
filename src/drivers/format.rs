// Card formatter: one MBR partition holding a FAT16 or FAT32 volume,
// laid out the way the volume manager expects to find it.
//
// Writes the MBR last so a card that loses power mid-format never
// mounts half-initialized.
//
// The volume manager's free-cluster search runs one entry past the last
// cluster and on to the end of that FAT block. The boot sector therefore
// declares one cluster less than the partition holds, and every FAT entry
// past the last cluster is marked bad.

use core::fmt::Debug;

use embedded_sdmmc::{Block, BlockDevice};
use log::info;

use crate::drivers::fat::{
    FAT16_BAD_CLUSTER, FAT16_MIN_CLUSTERS, FAT32_BAD_CLUSTER, FAT32_MIN_CLUSTERS, FatType,
    PARTITION_FAT16_LBA, PARTITION_FAT32_LBA, put16, put32, write_block,
};
use crate::error::Error;

// 1 MiB alignment, like SD card factory layouts
const PARTITION_START: u32 = 2048;

// below this many blocks the auto mode picks FAT16 (256 MiB)
const FAT32_THRESHOLD: u32 = 524_288;

const NUM_FATS: u32 = 2;
const FAT16_RESERVED: u32 = 1;
const FAT16_ROOT_ENTRIES: u32 = 512;
const FAT32_RESERVED: u32 = 32;
const FAT32_ROOT_CLUSTER: u32 = 2;
const FAT32_INFO_BLOCK: u32 = 1;
const FAT32_BACKUP_BOOT: u32 = 6;
const FAT32_MAX_CLUSTERS: u32 = 0x0FFF_FFF5;

const MEDIA_FIXED: u8 = 0xF8;
const DEFAULT_LABEL: &[u8; 11] = b"NO NAME    ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub fat_type: FatType,
    pub partition_start: u32,
    pub partition_blocks: u32,
    /// Blocks the boot sector declares; one cluster short of the partition.
    pub volume_blocks: u32,
    pub blocks_per_cluster: u32,
    pub reserved: u32,
    pub fat_blocks: u32,
    pub root_dir_blocks: u32,
    pub cluster_count: u32,
}

impl Layout {
    /// Pick a cluster size that puts the cluster count in `fat_type`'s range.
    pub fn plan(fat_type: FatType, partition_start: u32, partition_blocks: u32) -> Option<Self> {
        let (reserved, root_dir_blocks, candidates): (u32, u32, &[u32]) = match fat_type {
            FatType::Fat16 => (
                FAT16_RESERVED,
                FAT16_ROOT_ENTRIES * 32 / 512,
                &[1, 2, 4, 8, 16, 32, 64],
            ),
            FatType::Fat32 => (FAT32_RESERVED, 0, &[8, 4, 2, 1, 16, 32, 64]),
        };

        candidates.iter().find_map(|&bpc| {
            let volume_blocks = partition_blocks.checked_sub(bpc)?;
            let (fat_blocks, cluster_count) =
                size_fat(fat_type, volume_blocks, reserved, root_dir_blocks, bpc)?;
            let fits = match fat_type {
                FatType::Fat16 => (FAT16_MIN_CLUSTERS..FAT32_MIN_CLUSTERS).contains(&cluster_count),
                FatType::Fat32 => (FAT32_MIN_CLUSTERS..=FAT32_MAX_CLUSTERS).contains(&cluster_count),
            };
            fits.then_some(Layout {
                fat_type,
                partition_start,
                partition_blocks,
                volume_blocks,
                blocks_per_cluster: bpc,
                reserved,
                fat_blocks,
                root_dir_blocks,
                cluster_count,
            })
        })
    }

    fn fat_start(&self) -> u32 {
        self.partition_start + self.reserved
    }

    fn root_dir_start(&self) -> u32 {
        self.fat_start() + NUM_FATS * self.fat_blocks
    }

    fn data_start(&self) -> u32 {
        self.root_dir_start() + self.root_dir_blocks
    }

    fn entries_per_block(&self) -> u32 {
        512 / self.fat_type.entry_bytes()
    }

    // first FAT entry past the last cluster
    fn guard_entry(&self) -> u32 {
        self.cluster_count + 2
    }
}

// Grow the FAT until it covers every cluster left over after it, plus
// the guard entry past the last one.
fn size_fat(fat_type: FatType, total: u32, reserved: u32, root: u32, bpc: u32) -> Option<(u32, u32)> {
    let entry_bytes = fat_type.entry_bytes() as u64;
    let mut fat_blocks = 1u32;
    loop {
        let data = total.checked_sub(reserved + root + NUM_FATS * fat_blocks)?;
        let clusters = data / bpc;
        let needed = ((clusters as u64 + 3) * entry_bytes).div_ceil(512) as u32;
        if needed <= fat_blocks {
            return Some((fat_blocks, clusters));
        }
        fat_blocks = needed;
    }
}

/// Format `dev` with a FAT type chosen from its size.
pub fn format<D>(dev: &D, label: &str) -> Result<Layout, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let (start, blocks) = partition_extent(dev)?;
    let preferred = if blocks < FAT32_THRESHOLD {
        FatType::Fat16
    } else {
        FatType::Fat32
    };
    let fallback = match preferred {
        FatType::Fat16 => FatType::Fat32,
        FatType::Fat32 => FatType::Fat16,
    };
    let layout = Layout::plan(preferred, start, blocks)
        .or_else(|| Layout::plan(fallback, start, blocks))
        .ok_or(Error::Format("no FAT16/FAT32 layout fits this device"))?;
    write_layout(dev, &layout, label)?;
    Ok(layout)
}

/// Format `dev` as `fat_type`, failing if the device size does not allow it.
pub fn format_as<D>(dev: &D, fat_type: FatType, label: &str) -> Result<Layout, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let (start, blocks) = partition_extent(dev)?;
    let layout = Layout::plan(fat_type, start, blocks)
        .ok_or(Error::Format("device size does not fit the requested FAT type"))?;
    write_layout(dev, &layout, label)?;
    Ok(layout)
}

fn partition_extent<D>(dev: &D) -> Result<(u32, u32), Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let total = dev.num_blocks().map_err(Error::Device)?.0;
    let start = if total > 4 * PARTITION_START {
        PARTITION_START
    } else {
        1
    };
    Ok((start, total.saturating_sub(start)))
}

fn volume_label(label: &str) -> Result<[u8; 11], &'static str> {
    if label.is_empty() {
        return Ok(*DEFAULT_LABEL);
    }
    let bytes = label.as_bytes();
    if bytes.len() > 11 || !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Err("volume label must be up to 11 ASCII characters");
    }
    let mut out = [b' '; 11];
    for (dst, src) in out.iter_mut().zip(bytes) {
        *dst = src.to_ascii_uppercase();
    }
    Ok(out)
}

fn write_layout<D>(dev: &D, layout: &Layout, label: &str) -> Result<(), Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let label = volume_label(label).map_err(Error::Format)?;

    // reserved area, both FATs and the root directory start out zeroed
    let zero = Block::new();
    let root_end = match layout.fat_type {
        FatType::Fat16 => layout.data_start(),
        FatType::Fat32 => layout.data_start() + layout.blocks_per_cluster,
    };
    for idx in layout.partition_start..root_end {
        write_block(dev, idx, &zero)?;
    }

    let per_block = layout.entries_per_block();
    for n in 0..layout.fat_blocks {
        if n > 0 && (n + 1) * per_block <= layout.guard_entry() {
            continue;
        }
        let fat = fat_block(layout, n);
        for copy in 0..NUM_FATS {
            write_block(dev, layout.fat_start() + copy * layout.fat_blocks + n, &fat)?;
        }
    }

    let boot = boot_sector(layout, &label);
    write_block(dev, layout.partition_start, &boot)?;
    if layout.fat_type == FatType::Fat32 {
        let info = info_sector(layout);
        write_block(dev, layout.partition_start + FAT32_INFO_BLOCK, &info)?;
        write_block(dev, layout.partition_start + FAT32_BACKUP_BOOT, &boot)?;
        write_block(dev, layout.partition_start + FAT32_BACKUP_BOOT + FAT32_INFO_BLOCK, &info)?;
    }

    write_block(dev, 0, &mbr(layout))?;

    info!(
        "format: {:?}, {} clusters of {} bytes, label {:?}",
        layout.fat_type,
        layout.cluster_count,
        layout.blocks_per_cluster * 512,
        core::str::from_utf8(&label).unwrap_or("?").trim_end()
    );
    Ok(())
}

// Block `n` of a fresh FAT. Block 0 carries the reserved heads; entries
// past the last cluster read as bad so they are never handed out.
fn fat_block(layout: &Layout, n: u32) -> Block {
    let mut fat = Block::new();
    if n == 0 {
        match layout.fat_type {
            FatType::Fat16 => {
                put16(&mut fat[..], 0, 0xFF00 | MEDIA_FIXED as u16);
                put16(&mut fat[..], 2, 0xFFFF);
            }
            FatType::Fat32 => {
                put32(&mut fat[..], 0, 0x0FFF_FF00 | MEDIA_FIXED as u32);
                put32(&mut fat[..], 4, 0x0FFF_FFFF);
                // root directory cluster, end of chain
                put32(&mut fat[..], 8, 0x0FFF_FFFF);
            }
        }
    }

    let per_block = layout.entries_per_block();
    let first = n * per_block;
    for entry in layout.guard_entry().max(first)..first + per_block {
        let at = ((entry - first) * layout.fat_type.entry_bytes()) as usize;
        match layout.fat_type {
            FatType::Fat16 => put16(&mut fat[..], at, FAT16_BAD_CLUSTER),
            FatType::Fat32 => put32(&mut fat[..], at, FAT32_BAD_CLUSTER),
        }
    }
    fat
}

fn mbr(layout: &Layout) -> Block {
    let mut block = Block::new();
    let entry = &mut block[446..462];
    entry[0] = 0x00; // not bootable
    entry[1..4].copy_from_slice(&[0xFE, 0xFF, 0xFF]); // CHS unused, LBA only
    entry[4] = match layout.fat_type {
        FatType::Fat16 => PARTITION_FAT16_LBA,
        FatType::Fat32 => PARTITION_FAT32_LBA,
    };
    entry[5..8].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
    put32(entry, 8, layout.partition_start);
    put32(entry, 12, layout.partition_blocks);
    block[510] = 0x55;
    block[511] = 0xAA;
    block
}

fn boot_sector(layout: &Layout, label: &[u8; 11]) -> Block {
    let mut block = Block::new();
    let b = &mut block[..];
    let volume_id = 0x5D00_0000 ^ layout.volume_blocks ^ layout.cluster_count;

    b[3..11].copy_from_slice(b"MSWIN4.1");
    put16(b, 11, 512);
    b[13] = layout.blocks_per_cluster as u8;
    put16(b, 14, layout.reserved as u16);
    b[16] = NUM_FATS as u8;
    b[21] = MEDIA_FIXED;
    put16(b, 24, 63); // sectors per track
    put16(b, 26, 255); // heads
    put32(b, 28, layout.partition_start);

    match layout.fat_type {
        FatType::Fat16 => {
            b[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
            put16(b, 17, FAT16_ROOT_ENTRIES as u16);
            if layout.volume_blocks <= u16::MAX as u32 {
                put16(b, 19, layout.volume_blocks as u16);
            } else {
                put32(b, 32, layout.volume_blocks);
            }
            put16(b, 22, layout.fat_blocks as u16);
            b[36] = 0x80; // drive number
            b[38] = 0x29; // extended boot signature
            put32(b, 39, volume_id);
            b[43..54].copy_from_slice(label);
            b[54..62].copy_from_slice(b"FAT16   ");
        }
        FatType::Fat32 => {
            b[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
            put32(b, 32, layout.volume_blocks);
            put32(b, 36, layout.fat_blocks);
            put32(b, 44, FAT32_ROOT_CLUSTER);
            put16(b, 48, FAT32_INFO_BLOCK as u16);
            put16(b, 50, FAT32_BACKUP_BOOT as u16);
            b[64] = 0x80;
            b[66] = 0x29;
            put32(b, 67, volume_id);
            b[71..82].copy_from_slice(label);
            b[82..90].copy_from_slice(b"FAT32   ");
        }
    }

    b[510] = 0x55;
    b[511] = 0xAA;
    block
}

fn info_sector(layout: &Layout) -> Block {
    let mut block = Block::new();
    let b = &mut block[..];
    put32(b, 0, 0x4161_5252);
    put32(b, 484, 0x6141_7272);
    // the root directory already holds cluster 2
    put32(b, 488, layout.cluster_count - 1);
    put32(b, 492, FAT32_ROOT_CLUSTER + 1);
    put32(b, 508, 0xAA55_0000);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fat16_layout_for_a_small_card() {
        let layout = Layout::plan(FatType::Fat16, 2048, 30_720).unwrap();
        assert_eq!(layout.blocks_per_cluster, 1);
        assert_eq!(layout.root_dir_blocks, 32);
        assert!((FAT16_MIN_CLUSTERS..FAT32_MIN_CLUSTERS).contains(&layout.cluster_count));
        // two reserved entries, every cluster and the guard entry
        assert!((layout.cluster_count + 3) * 2 <= layout.fat_blocks * 512);
        let used = layout.reserved
            + NUM_FATS * layout.fat_blocks
            + layout.root_dir_blocks
            + layout.cluster_count * layout.blocks_per_cluster;
        assert!(used <= layout.volume_blocks);
        // a whole spare cluster sits past the declared volume
        assert_eq!(layout.volume_blocks + layout.blocks_per_cluster, layout.partition_blocks);
    }

    #[test]
    fn fat_tail_is_marked_bad() {
        for (fat_type, blocks) in [(FatType::Fat16, 30_720), (FatType::Fat32, 79_872)] {
            let layout = Layout::plan(fat_type, 2048, blocks).unwrap();
            let per_block = layout.entries_per_block();
            let guard = layout.guard_entry();
            let n = guard / per_block;
            let block = fat_block(&layout, n);
            let at = ((guard % per_block) * fat_type.entry_bytes()) as usize;
            let last = (512 - fat_type.entry_bytes()) as usize;
            match fat_type {
                FatType::Fat16 => {
                    assert_eq!(u16::from_le_bytes([block[at], block[at + 1]]), FAT16_BAD_CLUSTER);
                    assert_eq!(u16::from_le_bytes([block[last], block[last + 1]]), FAT16_BAD_CLUSTER);
                }
                FatType::Fat32 => {
                    let read = |i: usize| u32::from_le_bytes(block[i..i + 4].try_into().unwrap());
                    assert_eq!(read(at), FAT32_BAD_CLUSTER);
                    assert_eq!(read(last), FAT32_BAD_CLUSTER);
                }
            }
            // the last real cluster stays free
            if at > 0 {
                let before = at - fat_type.entry_bytes() as usize;
                assert!(block[before..at].iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn fat16_grows_clusters_on_larger_cards() {
        let layout = Layout::plan(FatType::Fat16, 2048, 1_000_000).unwrap();
        assert!(layout.blocks_per_cluster > 1);
        assert!(layout.cluster_count < FAT32_MIN_CLUSTERS);
    }

    #[test]
    fn fat32_needs_enough_clusters() {
        assert!(Layout::plan(FatType::Fat32, 2048, 30_720).is_none());
        let layout = Layout::plan(FatType::Fat32, 2048, 79_872).unwrap();
        assert_eq!(layout.blocks_per_cluster, 1);
        assert!(layout.cluster_count >= FAT32_MIN_CLUSTERS);
        assert_eq!(layout.root_dir_blocks, 0);
    }

    #[test]
    fn labels_are_padded_and_checked() {
        assert_eq!(&volume_label("sdcard").unwrap(), b"SDCARD     ");
        assert_eq!(&volume_label("").unwrap(), DEFAULT_LABEL);
        assert!(volume_label("much too long label").is_err());
    }

    #[test]
    fn mbr_points_at_the_partition() {
        let layout = Layout::plan(FatType::Fat16, 2048, 30_720).unwrap();
        let block = mbr(&layout);
        assert_eq!(block[446 + 4], PARTITION_FAT16_LBA);
        assert_eq!(&block[446 + 8..446 + 12], &2048u32.to_le_bytes());
        assert_eq!(&block[510..], &[0x55, 0xAA]);
    }
}
