// Raw FAT edits that embedded-sdmmc does not offer: dropping an entry
// together with its cluster chain (files, empty directories and whole
// trees), renaming an entry in place, and counting free clusters.
//
// Works straight on the block device. Callers must not hold an open
// volume while these run, or the volume manager's view goes stale.

use core::fmt::Debug;

use embedded_sdmmc::{Block, BlockDevice, BlockIdx};
use log::debug;

use crate::error::Error;
use crate::path::{DirPath, ShortName};

const BLOCK_LEN: usize = 512;
const DIR_ENTRY_LEN: usize = 32;
const ENTRIES_PER_BLOCK: usize = BLOCK_LEN / DIR_ENTRY_LEN;

const MBR_PARTITION_TABLE: usize = 446;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

const ATTR_VOLUME: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LFN: u8 = 0x0F;

const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;
// "." and ".." are the only short names starting with a dot
const ENTRY_DOT: u8 = b'.';

// one long name needs at most 20 slots (255 chars / 13)
const MAX_LFN_SLOTS: usize = 20;

const FSINFO_FREE_COUNT: usize = 488;
const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

// nesting limit for tree removal; deeper means a looped directory chain
const MAX_TREE_DEPTH: usize = 64;

// FAT values marking a cluster that must never be allocated
pub(crate) const FAT16_BAD_CLUSTER: u16 = 0xFFF7;
pub(crate) const FAT32_BAD_CLUSTER: u32 = 0x0FFF_FFF7;

// partition types we accept, same set the volume manager mounts
pub(crate) const PARTITION_FAT16_SMALL: u8 = 0x04;
pub(crate) const PARTITION_FAT16: u8 = 0x06;
pub(crate) const PARTITION_FAT32_CHS: u8 = 0x0B;
pub(crate) const PARTITION_FAT32_LBA: u8 = 0x0C;
pub(crate) const PARTITION_FAT16_LBA: u8 = 0x0E;

// cluster count thresholds that decide the FAT width
pub(crate) const FAT16_MIN_CLUSTERS: u32 = 4085;
pub(crate) const FAT32_MIN_CLUSTERS: u32 = 65525;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

impl FatType {
    pub(crate) fn entry_bytes(self) -> u32 {
        match self {
            FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        }
    }
}

// Volume 0 layout, all block numbers absolute on the device.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub fat_type: FatType,
    fat_start: u32,
    fat_blocks: u32,
    num_fats: u32,
    root_dir_start: u32,
    root_dir_blocks: u32,
    root_cluster: u32,
    data_start: u32,
    blocks_per_cluster: u32,
    cluster_count: u32,
    info_block: Option<u32>,
}

pub(crate) fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

pub(crate) fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

pub(crate) fn put16(b: &mut [u8], at: usize, v: u16) {
    b[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put32(b: &mut [u8], at: usize, v: u32) {
    b[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_block<D>(dev: &D, idx: u32) -> Result<Block, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let mut blocks = [Block::new()];
    dev.read(&mut blocks, BlockIdx(idx)).map_err(Error::Device)?;
    let [block] = blocks;
    Ok(block)
}

pub(crate) fn write_block<D>(dev: &D, idx: u32, block: &Block) -> Result<(), Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    dev.write(core::slice::from_ref(block), BlockIdx(idx))
        .map_err(Error::Device)
}

impl Geometry {
    pub fn read<D>(dev: &D) -> Result<Self, Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let mbr = read_block(dev, 0)?;
        if mbr[510..512] != BOOT_SIGNATURE {
            return Err(Error::Corrupt("bad MBR signature"));
        }
        let part = &mbr[MBR_PARTITION_TABLE..MBR_PARTITION_TABLE + 16];
        if !matches!(
            part[4],
            PARTITION_FAT16_SMALL
                | PARTITION_FAT16
                | PARTITION_FAT32_CHS
                | PARTITION_FAT32_LBA
                | PARTITION_FAT16_LBA
        ) {
            return Err(Error::Corrupt("unsupported partition type"));
        }
        let lba_start = le32(part, 8);

        let bpb = read_block(dev, lba_start)?;
        if bpb[510..512] != BOOT_SIGNATURE {
            return Err(Error::Corrupt("bad boot sector signature"));
        }
        if le16(&bpb[..], 11) as usize != BLOCK_LEN {
            return Err(Error::Corrupt("block size is not 512"));
        }

        let blocks_per_cluster = bpb[13] as u32;
        let reserved = le16(&bpb[..], 14) as u32;
        let num_fats = bpb[16] as u32;
        let root_entries = le16(&bpb[..], 17) as u32;
        let total = match le16(&bpb[..], 19) {
            0 => le32(&bpb[..], 32),
            n => n as u32,
        };
        let fat_blocks = match le16(&bpb[..], 22) {
            0 => le32(&bpb[..], 36),
            n => n as u32,
        };
        if blocks_per_cluster == 0 || num_fats == 0 || fat_blocks == 0 {
            return Err(Error::Corrupt("zero field in BPB"));
        }

        let root_dir_blocks = (root_entries * DIR_ENTRY_LEN as u32).div_ceil(BLOCK_LEN as u32);
        let meta = reserved + num_fats * fat_blocks + root_dir_blocks;
        let data_blocks = total
            .checked_sub(meta)
            .ok_or(Error::Corrupt("BPB larger than volume"))?;
        let cluster_count = data_blocks / blocks_per_cluster;

        let fat_start = lba_start + reserved;
        let root_dir_start = fat_start + num_fats * fat_blocks;

        let (fat_type, root_cluster, info_block) = if cluster_count < FAT16_MIN_CLUSTERS {
            return Err(Error::Corrupt("FAT12 volumes are not supported"));
        } else if cluster_count < FAT32_MIN_CLUSTERS {
            (FatType::Fat16, 0, None)
        } else {
            let info = match le16(&bpb[..], 48) {
                0 | 0xFFFF => None,
                n => Some(lba_start + n as u32),
            };
            (FatType::Fat32, le32(&bpb[..], 44), info)
        };

        Ok(Self {
            fat_type,
            fat_start,
            fat_blocks,
            num_fats,
            root_dir_start,
            root_dir_blocks,
            root_cluster,
            data_start: root_dir_start + root_dir_blocks,
            blocks_per_cluster,
            cluster_count,
            info_block,
        })
    }

    fn root(&self) -> DirStart {
        match self.fat_type {
            FatType::Fat16 => DirStart::FixedRoot,
            FatType::Fat32 => DirStart::Cluster(self.root_cluster),
        }
    }

    fn cluster_block(&self, cluster: u32) -> u32 {
        self.data_start + (cluster - 2) * self.blocks_per_cluster
    }

    fn entry_bytes(&self) -> u32 {
        self.fat_type.entry_bytes()
    }

    fn is_chain_end(&self, value: u32) -> bool {
        match self.fat_type {
            FatType::Fat16 => value >= 0xFFF8,
            FatType::Fat32 => value >= 0x0FFF_FFF8,
        }
    }

    fn is_data_cluster(&self, value: u32) -> bool {
        value >= 2 && value < self.cluster_count + 2
    }

    fn fat_entry<D>(&self, dev: &D, cluster: u32) -> Result<u32, Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let offset = cluster * self.entry_bytes();
        let block = read_block(dev, self.fat_start + offset / BLOCK_LEN as u32)?;
        Ok(self.decode(&block, (offset as usize) % BLOCK_LEN))
    }

    fn decode(&self, block: &Block, at: usize) -> u32 {
        match self.fat_type {
            FatType::Fat16 => le16(&block[..], at) as u32,
            FatType::Fat32 => le32(&block[..], at) & 0x0FFF_FFFF,
        }
    }

    // Zero entries in the first FAT copy, one block read per FAT block.
    fn count_free<D>(&self, dev: &D) -> Result<u32, Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let per_block = BLOCK_LEN as u32 / self.entry_bytes();
        let end = self.cluster_count + 2;
        let mut free = 0;
        let mut cluster = 2;
        while cluster < end {
            let block = read_block(dev, self.fat_start + cluster / per_block)?;
            let last = ((cluster / per_block + 1) * per_block).min(end);
            for c in cluster..last {
                let at = ((c % per_block) * self.entry_bytes()) as usize;
                if self.decode(&block, at) == 0 {
                    free += 1;
                }
            }
            cluster = last;
        }
        Ok(free)
    }

    // writes every FAT copy
    fn set_fat_entry<D>(&self, dev: &D, cluster: u32, value: u32) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let offset = cluster * self.entry_bytes();
        let at = (offset as usize) % BLOCK_LEN;
        for copy in 0..self.num_fats {
            let idx = self.fat_start + copy * self.fat_blocks + offset / BLOCK_LEN as u32;
            let mut block = read_block(dev, idx)?;
            match self.fat_type {
                FatType::Fat16 => put16(&mut block[..], at, value as u16),
                FatType::Fat32 => {
                    // top nibble is reserved and must survive
                    let keep = le32(&block[..], at) & 0xF000_0000;
                    put32(&mut block[..], at, keep | (value & 0x0FFF_FFFF));
                }
            }
            write_block(dev, idx, &block)?;
        }
        Ok(())
    }

    // Release every cluster of the chain starting at `first`.
    fn free_chain<D>(&self, dev: &D, first: u32) -> Result<u32, Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let mut freed = 0u32;
        let mut cluster = first;
        while self.is_data_cluster(cluster) {
            let next = self.fat_entry(dev, cluster)?;
            self.set_fat_entry(dev, cluster, 0)?;
            freed += 1;
            if self.is_chain_end(next) {
                break;
            }
            if !self.is_data_cluster(next) || freed > self.cluster_count {
                return Err(Error::Corrupt("broken cluster chain"));
            }
            cluster = next;
        }
        Ok(freed)
    }

    fn note_freed<D>(&self, dev: &D, freed: u32) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let Some(idx) = self.info_block else {
            return Ok(());
        };
        let mut info = read_block(dev, idx)?;
        let free = le32(&info[..], FSINFO_FREE_COUNT);
        if free == FSINFO_UNKNOWN {
            return Ok(());
        }
        put32(&mut info[..], FSINFO_FREE_COUNT, free.saturating_add(freed).min(self.cluster_count));
        write_block(dev, idx, &info)
    }

    // Walk `path` from the root down to the directory it names.
    fn open_dir<D>(&self, dev: &D, path: &DirPath) -> Result<DirStart, Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let mut dir = self.root();
        for name in path.components() {
            let slot = self.find(dev, dir, &name.fat_bytes())?.ok_or(Error::NotFound)?;
            if !slot.is_dir() {
                return Err(Error::NotADirectory);
            }
            dir = match slot.first_cluster() {
                // ".." of a first-level directory points back at the root
                0 => self.root(),
                c => DirStart::Cluster(c),
            };
        }
        Ok(dir)
    }

    fn find<D>(&self, dev: &D, dir: DirStart, name: &[u8; 11]) -> Result<Option<Slot>, Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let mut blocks = DirBlocks::new(self, dir);
        let mut lfn = LfnRun::default();

        while let Some(idx) = blocks.next(self, dev)? {
            let block = read_block(dev, idx)?;
            for i in 0..ENTRIES_PER_BLOCK {
                let raw = &block[i * DIR_ENTRY_LEN..(i + 1) * DIR_ENTRY_LEN];
                match raw[0] {
                    ENTRY_END => return Ok(None),
                    ENTRY_DELETED => lfn.clear(),
                    _ if raw[11] == ATTR_LFN => lfn.push(idx, i),
                    _ if raw[11] & ATTR_VOLUME != 0 => lfn.clear(),
                    _ if raw[..11] == name[..] => {
                        let mut entry = [0u8; DIR_ENTRY_LEN];
                        entry.copy_from_slice(raw);
                        return Ok(Some(Slot {
                            block: idx,
                            index: i,
                            entry,
                            lfn,
                        }));
                    }
                    _ => lfn.clear(),
                }
            }
        }
        Ok(None)
    }

    fn mark_deleted<D>(&self, dev: &D, block: u32, index: usize) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        let mut data = read_block(dev, block)?;
        data[index * DIR_ENTRY_LEN] = ENTRY_DELETED;
        write_block(dev, block, &data)
    }

    // Drop the short entry and the long-name run in front of it.
    fn unlink<D>(&self, dev: &D, slot: &Slot) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        for &(block, index) in slot.lfn.iter() {
            self.mark_deleted(dev, block, index)?;
        }
        self.mark_deleted(dev, slot.block, slot.index)
    }

    // Free the chains of everything stored below the directory at `first`.
    // Entries are matched on their raw bytes, so names that do not parse
    // as short names still go. The directory's own chain is left alone.
    fn free_children<D>(&self, dev: &D, first: u32, depth: usize) -> Result<u32, Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::Corrupt("directory tree too deep"));
        }
        let mut freed = 0;
        let mut blocks = DirBlocks::new(self, DirStart::Cluster(first));
        while let Some(idx) = blocks.next(self, dev)? {
            let block = read_block(dev, idx)?;
            for raw in block.chunks_exact(DIR_ENTRY_LEN) {
                match raw[0] {
                    ENTRY_END => return Ok(freed),
                    ENTRY_DELETED | ENTRY_DOT => continue,
                    _ if raw[11] == ATTR_LFN || raw[11] & ATTR_VOLUME != 0 => continue,
                    _ => {}
                }
                let cluster = entry_cluster(raw);
                if raw[11] & ATTR_DIRECTORY != 0 && self.is_data_cluster(cluster) {
                    freed += self.free_children(dev, cluster, depth + 1)?;
                }
                freed += self.free_chain(dev, cluster)?;
            }
        }
        Ok(freed)
    }
}

#[derive(Debug, Clone, Copy)]
enum DirStart {
    // FAT16 root directory region
    FixedRoot,
    Cluster(u32),
}

// Block cursor over one directory, following its cluster chain.
struct DirBlocks {
    cluster: Option<u32>,
    base: u32,
    len: u32,
    pos: u32,
    hops: u32,
}

impl DirBlocks {
    fn new(geom: &Geometry, dir: DirStart) -> Self {
        match dir {
            DirStart::FixedRoot => Self {
                cluster: None,
                base: geom.root_dir_start,
                len: geom.root_dir_blocks,
                pos: 0,
                hops: 0,
            },
            DirStart::Cluster(c) => Self {
                cluster: Some(c),
                base: geom.cluster_block(c),
                len: geom.blocks_per_cluster,
                pos: 0,
                hops: 0,
            },
        }
    }

    fn next<D>(&mut self, geom: &Geometry, dev: &D) -> Result<Option<u32>, Error<D::Error>>
    where
        D: BlockDevice,
        D::Error: Debug,
    {
        if self.pos < self.len {
            self.pos += 1;
            return Ok(Some(self.base + self.pos - 1));
        }
        let Some(current) = self.cluster else {
            return Ok(None);
        };
        let next = geom.fat_entry(dev, current)?;
        if geom.is_chain_end(next) {
            self.cluster = None;
            return Ok(None);
        }
        self.hops += 1;
        if !geom.is_data_cluster(next) || self.hops > geom.cluster_count {
            return Err(Error::Corrupt("broken directory chain"));
        }
        self.cluster = Some(next);
        self.base = geom.cluster_block(next);
        self.pos = 1;
        Ok(Some(self.base))
    }
}

// Long-name slots sitting directly in front of a short entry.
#[derive(Clone, Copy, Default)]
struct LfnRun {
    slots: [(u32, usize); MAX_LFN_SLOTS],
    len: usize,
}

impl LfnRun {
    fn push(&mut self, block: u32, index: usize) {
        if self.len == MAX_LFN_SLOTS {
            // orphaned run; only the tail can belong to the next entry
            self.slots.copy_within(1.., 0);
            self.len -= 1;
        }
        self.slots[self.len] = (block, index);
        self.len += 1;
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn iter(&self) -> impl Iterator<Item = &(u32, usize)> {
        self.slots[..self.len].iter()
    }
}

struct Slot {
    block: u32,
    index: usize,
    entry: [u8; DIR_ENTRY_LEN],
    lfn: LfnRun,
}

impl Slot {
    fn is_dir(&self) -> bool {
        self.entry[11] & ATTR_DIRECTORY != 0
    }

    fn first_cluster(&self) -> u32 {
        entry_cluster(&self.entry)
    }
}

fn entry_cluster(raw: &[u8]) -> u32 {
    ((le16(raw, 20) as u32) << 16) | le16(raw, 26) as u32
}

// Volume layout plus the slot of `name` inside `parent`.
fn locate<D>(dev: &D, parent: &DirPath, name: &ShortName) -> Result<(Geometry, Slot), Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let geom = Geometry::read(dev)?;
    let dir = geom.open_dir(dev, parent)?;
    let slot = geom
        .find(dev, dir, &name.fat_bytes())?
        .ok_or(Error::NotFound)?;
    Ok((geom, slot))
}

/// Remove the file `name` from `parent` and free its clusters. Returns
/// the number of clusters released.
pub(crate) fn remove_file<D>(dev: &D, parent: &DirPath, name: &ShortName) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let (geom, slot) = locate(dev, parent, name)?;
    if slot.is_dir() {
        return Err(Error::IsADirectory);
    }

    geom.unlink(dev, &slot)?;
    let freed = geom.free_chain(dev, slot.first_cluster())?;
    geom.note_freed(dev, freed)?;
    debug!("fat: removed {}/{} ({} clusters)", parent, name, freed);
    Ok(freed)
}

/// Remove the (already emptied) directory `name` from `parent` and free
/// its clusters. Returns the number of clusters released.
pub(crate) fn remove_dir<D>(dev: &D, parent: &DirPath, name: &ShortName) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let (geom, slot) = locate(dev, parent, name)?;
    if !slot.is_dir() {
        return Err(Error::NotADirectory);
    }

    // unlink before freeing the chain
    geom.unlink(dev, &slot)?;
    let freed = geom.free_chain(dev, slot.first_cluster())?;
    geom.note_freed(dev, freed)?;
    debug!("fat: removed dir {}/{} ({} clusters)", parent, name, freed);
    Ok(freed)
}

/// Remove the directory `name` from `parent` with everything below it.
/// Returns the number of clusters released.
pub(crate) fn remove_tree<D>(dev: &D, parent: &DirPath, name: &ShortName) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let (geom, slot) = locate(dev, parent, name)?;
    if !slot.is_dir() {
        return Err(Error::NotADirectory);
    }
    let first = slot.first_cluster();
    if !geom.is_data_cluster(first) {
        return Err(Error::Corrupt("directory without clusters"));
    }

    geom.unlink(dev, &slot)?;
    let freed = geom.free_children(dev, first, 0)? + geom.free_chain(dev, first)?;
    geom.note_freed(dev, freed)?;
    debug!("fat: removed tree {}/{} ({} clusters)", parent, name, freed);
    Ok(freed)
}

/// Give the entry `from` in `parent` the short name `to`.
pub(crate) fn rename_entry<D>(
    dev: &D,
    parent: &DirPath,
    from: &ShortName,
    to: &ShortName,
) -> Result<(), Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    let (geom, slot) = locate(dev, parent, from)?;
    if from == to {
        return Ok(());
    }
    let dir = geom.open_dir(dev, parent)?;
    if geom.find(dev, dir, &to.fat_bytes())?.is_some() {
        return Err(Error::AlreadyExists);
    }

    // the old long name no longer matches; drop it
    for &(block, index) in slot.lfn.iter() {
        geom.mark_deleted(dev, block, index)?;
    }
    let mut data = read_block(dev, slot.block)?;
    let at = slot.index * DIR_ENTRY_LEN;
    data[at..at + 11].copy_from_slice(&to.fat_bytes());
    write_block(dev, slot.block, &data)?;

    debug!("fat: renamed {}/{} -> {}", parent, from, to);
    Ok(())
}

/// FAT flavour of volume 0.
pub fn fat_type<D>(dev: &D) -> Result<FatType, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    Ok(Geometry::read(dev)?.fat_type)
}

/// Number of unallocated clusters on volume 0, counted from the FAT.
pub fn free_clusters<D>(dev: &D) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    Geometry::read(dev)?.count_free(dev)
}

/// Bytes per cluster on volume 0.
pub fn cluster_bytes<D>(dev: &D) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    D::Error: Debug,
{
    Ok(Geometry::read(dev)?.blocks_per_cluster * BLOCK_LEN as u32)
}
