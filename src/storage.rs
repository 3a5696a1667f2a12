// SdCardUtils: path-based file and directory operations on a mounted
// FAT volume.
//
// The wrapper owns the block device. Each call builds a VolumeManager over
// a borrowed device, opens volume 0, walks to the target directory and
// drops every handle before it returns. Deletes and renames go through
// drivers::fat with no volume open.

use core::fmt::Debug;

use embedded_sdmmc::{BlockDevice, Mode, SdCard, SdCardError, TimeSource, VolumeIdx, VolumeManager};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::SdConfig;
use crate::csv::{self, CsvRow, LineReader};
use crate::drivers::fat::{self, FatType};
use crate::drivers::sdcard::{self, DeviceRef, FixedTimeSource};
use crate::entry::{self, DirEntry, DirPage};
use crate::error::{Error, ErrorKind, Result};
use crate::json::{self, JsonError};
use crate::path::{DirPath, PathError, ShortName};

type FatEntry = embedded_sdmmc::DirEntry;

// open volume 0, walk from the root down `path`, run body with that dir
macro_rules! with_dir {
    ($sd:expr, $path:expr, |$dir:ident| $body:expr) => {{
        let volume_mgr = $sd.volume_mgr();
        let volume = volume_mgr.open_volume(VolumeIdx(0))?;
        let mut $dir = volume.open_root_dir()?;
        for name in $path.components() {
            $dir.change_dir(name.as_str())?;
        }
        $body
    }};
}

pub struct SdCardUtils<D, T = FixedTimeSource>
where
    D: BlockDevice,
    T: TimeSource + Clone,
{
    device: D,
    time_source: T,
    mount_path: &'static str,
    cwd: DirPath,
}

impl<SPI, DELAY> SdCardUtils<SdCard<SPI, DELAY>>
where
    SPI: embedded_hal::spi::SpiDevice<u8>,
    DELAY: embedded_hal::delay::DelayNs,
{
    /// Bring up the card behind `spi` and mount its first FAT volume.
    pub fn from_spi(spi: SPI, delay: DELAY, config: &SdConfig) -> Result<Self, SdCardError> {
        let card = sdcard::init_card(spi, delay)
            .map_err(|e| Error::Mount(embedded_sdmmc::Error::DeviceError(e)))?;
        Self::mount(card, config)
    }
}

impl<D: BlockDevice> SdCardUtils<D, FixedTimeSource> {
    /// Mount volume 0 of `device`, stamping entries with the config date.
    pub fn mount(device: D, config: &SdConfig) -> Result<Self, D::Error> {
        let mut config = *config;
        config.sanitize();
        Self::mount_with_time_source(device, FixedTimeSource::new(config.date), &config)
    }
}

impl<D, T> SdCardUtils<D, T>
where
    D: BlockDevice,
    T: TimeSource + Clone,
{
    pub fn mount_with_time_source(device: D, time_source: T, config: &SdConfig) -> Result<Self, D::Error> {
        let mut config = *config;
        config.sanitize();
        config.validate()?;

        let sd = Self {
            device,
            time_source,
            mount_path: config.mount_path,
            cwd: DirPath::ROOT,
        };
        sd.check_volume()?;
        info!("SD volume mounted at {}", sd.mount_path);
        Ok(sd)
    }

    /// Release the card; the device comes back for reuse.
    pub fn unmount(self) -> D {
        info!("SD volume at {} unmounted", self.mount_path);
        self.device
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn mount_path(&self) -> &'static str {
        self.mount_path
    }

    pub fn cwd(&self) -> &DirPath {
        &self.cwd
    }

    pub fn fat_type(&self) -> Result<FatType, D::Error> {
        fat::fat_type(&self.device)
    }

    /// Unallocated clusters on the volume.
    pub fn free_clusters(&self) -> Result<u32, D::Error> {
        fat::free_clusters(&self.device)
    }

    /// Bytes still available for file data.
    pub fn free_bytes(&self) -> Result<u64, D::Error> {
        let clusters = fat::free_clusters(&self.device)?;
        Ok(clusters as u64 * fat::cluster_bytes(&self.device)? as u64)
    }

    fn volume_mgr(&self) -> VolumeManager<DeviceRef<'_, D>, T> {
        VolumeManager::new(DeviceRef(&self.device), self.time_source.clone())
    }

    fn check_volume(&self) -> Result<(), D::Error> {
        let volume_mgr = self.volume_mgr();
        let volume = volume_mgr.open_volume(VolumeIdx(0)).map_err(Error::Mount)?;
        let _root = volume.open_root_dir().map_err(Error::Mount)?;
        Ok(())
    }

    fn resolve(&self, path: &str) -> Result<DirPath, D::Error> {
        Ok(DirPath::resolve(&self.cwd, self.mount_path, path)?)
    }

    // resolved path, its parent and final component; the root has no name
    fn named(&self, path: &str) -> Result<(DirPath, DirPath, ShortName), D::Error> {
        let target = self.resolve(path)?;
        let (parent, name) = target.split_last().ok_or(PathError::Root)?;
        Ok((target, parent, name))
    }

    // entry at `target`, None if its parent has no such name
    fn lookup(&self, target: &DirPath) -> Result<Option<DirEntry>, D::Error> {
        let Some((parent, name)) = target.split_last() else {
            return Ok(Some(DirEntry::ROOT));
        };
        with_dir!(self, parent, |dir| {
            let entry = found(dir.find_directory_entry(name.as_str()))?;
            Ok(entry.as_ref().map(DirEntry::from_fat))
        })
    }

    // like lookup, but a missing or non-directory parent also means "absent"
    fn lookup_path(&self, path: &str) -> Result<Option<DirEntry>, D::Error> {
        let target = self.resolve(path)?;
        match self.lookup(&target) {
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => Ok(None),
            res => res,
        }
    }

    // ---- queries ----

    pub fn exists(&self, path: &str) -> Result<bool, D::Error> {
        Ok(self.lookup_path(path)?.is_some())
    }

    pub fn is_dir(&self, path: &str) -> Result<bool, D::Error> {
        Ok(self.lookup_path(path)?.is_some_and(|e| e.is_dir))
    }

    pub fn is_file(&self, path: &str) -> Result<bool, D::Error> {
        Ok(self.lookup_path(path)?.is_some_and(|e| !e.is_dir))
    }

    pub fn dir_exists(&self, path: &str) -> Result<bool, D::Error> {
        self.is_dir(path)
    }

    pub fn file_exists(&self, path: &str) -> Result<bool, D::Error> {
        self.is_file(path)
    }

    /// Name, kind and size of the entry at `path`.
    pub fn stat(&self, path: &str) -> Result<DirEntry, D::Error> {
        let target = self.resolve(path)?;
        self.lookup(&target)?.ok_or(Error::NotFound)
    }

    pub fn file_size(&self, path: &str) -> Result<u32, D::Error> {
        let entry = self.stat(path)?;
        if entry.is_dir {
            return Err(Error::IsADirectory);
        }
        Ok(entry.size)
    }

    // ---- files ----

    /// Create an empty file. Fails if any entry by that name exists.
    pub fn create_file(&self, path: &str) -> Result<(), D::Error> {
        self.create_file_with(path, &[], false)
    }

    /// Create a file holding `data`; with `force`, missing parent
    /// directories are created first.
    pub fn create_file_with(&self, path: &str, data: &[u8], force: bool) -> Result<(), D::Error> {
        let (target, parent, name) = self.named(path)?;
        if force {
            self.make_dirs(&parent)?;
        }
        with_dir!(self, parent, |dir| {
            if found(dir.find_directory_entry(name.as_str()))?.is_some() {
                return Err(Error::AlreadyExists);
            }
            let file = dir.open_file_in_dir(name.as_str(), Mode::ReadWriteCreate)?;
            if !data.is_empty() {
                file.write(data)?;
            }
            file.flush()?;
            debug!("sd: created {} ({} bytes)", target, data.len());
            Ok(())
        })
    }

    /// Replace the contents of `path`, creating it if needed.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<(), D::Error> {
        let (target, parent, name) = self.named(path)?;
        with_dir!(self, parent, |dir| {
            if let Some(entry) = found(dir.find_directory_entry(name.as_str()))? {
                if entry.attributes.is_directory() {
                    return Err(Error::IsADirectory);
                }
            }
            let file = dir.open_file_in_dir(name.as_str(), Mode::ReadWriteCreateOrTruncate)?;
            file.write(data)?;
            file.flush()?;
            debug!("sd: wrote {} ({} bytes)", target, data.len());
            Ok(())
        })
    }

    /// Append `data` to an existing file.
    pub fn update_file(&self, path: &str, data: &[u8]) -> Result<(), D::Error> {
        let (target, parent, name) = self.named(path)?;
        with_dir!(self, parent, |dir| {
            require_file(found(dir.find_directory_entry(name.as_str()))?)?;
            let file = dir.open_file_in_dir(name.as_str(), Mode::ReadWriteAppend)?;
            file.write(data)?;
            file.flush()?;
            debug!("sd: appended {} bytes to {}", data.len(), target);
            Ok(())
        })
    }

    /// Read from the start of `path` until `buf` is full or the file ends.
    pub fn read_file(&self, path: &str, buf: &mut [u8]) -> Result<usize, D::Error> {
        self.read_chunk(path, 0, buf)
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Returns 0 at or
    /// past the end of the file.
    pub fn read_chunk(&self, path: &str, offset: u32, buf: &mut [u8]) -> Result<usize, D::Error> {
        let (_, parent, name) = self.named(path)?;
        with_dir!(self, parent, |dir| {
            require_file(found(dir.find_directory_entry(name.as_str()))?)?;
            let file = dir.open_file_in_dir(name.as_str(), Mode::ReadOnly)?;
            if offset >= file.length() {
                return Ok(0);
            }
            file.seek_from_start(offset)?;
            let mut total = 0;
            while !file.is_eof() && total < buf.len() {
                let n = file.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            Ok(total)
        })
    }

    /// Remove a file and release its clusters.
    pub fn delete_file(&self, path: &str) -> Result<(), D::Error> {
        let (target, parent, name) = self.named(path)?;
        let freed = fat::remove_file(&self.device, &parent, &name)?;
        debug!("sd: deleted {} ({} clusters freed)", target, freed);
        Ok(())
    }

    /// Rename an entry inside its directory. `to` may be a bare name or a
    /// path with the same parent as `from`.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), D::Error> {
        let (source, parent, from_name) = self.named(from)?;
        let to_name = if to.contains('/') {
            let (_, to_parent, to_name) = self.named(to)?;
            if to_parent != parent {
                return Err(PathError::CrossDirectory.into());
            }
            to_name
        } else {
            ShortName::parse(to)?
        };
        fat::rename_entry(&self.device, &parent, &from_name, &to_name)?;
        debug!("sd: renamed {} -> {}", source, to_name);
        Ok(())
    }

    // ---- directories ----

    pub fn create_dir(&self, path: &str) -> Result<(), D::Error> {
        let target = self.resolve(path)?;
        self.create_dir_at(&target)
    }

    fn create_dir_at(&self, target: &DirPath) -> Result<(), D::Error> {
        let (parent, name) = target.split_last().ok_or(Error::AlreadyExists)?;
        with_dir!(self, parent, |dir| {
            if found(dir.find_directory_entry(name.as_str()))?.is_some() {
                return Err(Error::AlreadyExists);
            }
            dir.make_dir_in_dir(name.as_str())?;
            debug!("sd: created dir {}", target);
            Ok(())
        })
    }

    /// Create `path` and any missing parents. Existing directories are fine.
    pub fn create_dir_all(&self, path: &str) -> Result<(), D::Error> {
        let target = self.resolve(path)?;
        self.make_dirs(&target)
    }

    fn make_dirs(&self, target: &DirPath) -> Result<(), D::Error> {
        for depth in 1..=target.depth() {
            let prefix = target.prefix(depth);
            match self.lookup(&prefix)? {
                Some(entry) if entry.is_dir => {}
                Some(_) => return Err(Error::NotADirectory),
                None => self.create_dir_at(&prefix)?,
            }
        }
        Ok(())
    }

    /// Remove an empty directory.
    pub fn delete_dir(&self, path: &str) -> Result<(), D::Error> {
        let target = self.resolve(path)?;
        self.require_dir(&target)?;
        self.delete_dir_at(&target)
    }

    /// Remove a directory and everything below it.
    pub fn delete_dir_all(&self, path: &str) -> Result<(), D::Error> {
        let target = self.resolve(path)?;
        self.require_dir(&target)?;
        let (parent, name) = target.split_last().ok_or(PathError::Root)?;
        let freed = fat::remove_tree(&self.device, &parent, &name)?;
        debug!("sd: deleted tree {} ({} clusters freed)", target, freed);
        Ok(())
    }

    fn require_dir(&self, target: &DirPath) -> Result<(), D::Error> {
        if target.is_root() {
            return Err(PathError::Root.into());
        }
        match self.lookup(target)? {
            Some(entry) if entry.is_dir => Ok(()),
            Some(_) => Err(Error::NotADirectory),
            None => Err(Error::NotFound),
        }
    }

    fn delete_dir_at(&self, target: &DirPath) -> Result<(), D::Error> {
        let (parent, name) = target.split_last().ok_or(PathError::Root)?;
        if self.first_child(target)?.is_some() {
            return Err(Error::DirectoryNotEmpty);
        }
        let freed = fat::remove_dir(&self.device, &parent, &name)?;
        debug!("sd: deleted dir {} ({} clusters freed)", target, freed);
        Ok(())
    }

    fn first_child(&self, target: &DirPath) -> Result<Option<DirEntry>, D::Error> {
        with_dir!(self, target, |dir| {
            let mut first = None;
            dir.iterate_dir(|e| {
                if first.is_none() && entry::is_listed(e) {
                    first = Some(DirEntry::from_fat(e));
                }
            })?;
            Ok(first)
        })
    }

    /// Visit every entry of the directory at `path` in on-disk order.
    pub fn for_each_entry<F>(&self, path: &str, mut f: F) -> Result<(), D::Error>
    where
        F: FnMut(&DirEntry),
    {
        let target = self.resolve(path)?;
        with_dir!(self, target, |dir| {
            dir.iterate_dir(|e| {
                if entry::is_listed(e) {
                    f(&DirEntry::from_fat(e));
                }
            })?;
            Ok(())
        })
    }

    /// Copy the directory listing into `buf`. `total` counts every entry,
    /// including the ones that did not fit.
    pub fn list(&self, path: &str, buf: &mut [DirEntry]) -> Result<DirPage, D::Error> {
        let mut total = 0;
        self.for_each_entry(path, |e| {
            if let Some(slot) = buf.get_mut(total) {
                *slot = *e;
            }
            total += 1;
        })?;
        Ok(DirPage {
            total,
            count: total.min(buf.len()),
        })
    }

    /// Change the current directory; with `create`, missing directories
    /// along the way are made first.
    pub fn cd(&mut self, path: &str, create: bool) -> Result<(), D::Error> {
        let target = self.resolve(path)?;
        if create {
            self.make_dirs(&target)?;
        }
        match self.lookup(&target)? {
            Some(entry) if entry.is_dir => {
                debug!("sd: cwd {} -> {}", self.cwd, target);
                self.cwd = target;
                Ok(())
            }
            Some(_) => Err(Error::NotADirectory),
            None => Err(Error::NotFound),
        }
    }

    // ---- csv ----

    /// Write `rows` as a new CSV file, replacing any previous contents.
    pub fn write_csv(&self, path: &str, rows: &[&[&str]], separator: u8) -> Result<(), D::Error> {
        self.write_rows(path, rows, separator, false)
    }

    /// Append `rows` to an existing CSV file.
    pub fn update_csv(&self, path: &str, rows: &[&[&str]], separator: u8) -> Result<(), D::Error> {
        self.write_rows(path, rows, separator, true)
    }

    fn write_rows(&self, path: &str, rows: &[&[&str]], separator: u8, append: bool) -> Result<(), D::Error> {
        let (target, parent, name) = self.named(path)?;
        with_dir!(self, parent, |dir| {
            let existing = found(dir.find_directory_entry(name.as_str()))?;
            let mode = if append {
                require_file(existing)?;
                Mode::ReadWriteAppend
            } else {
                if existing.is_some_and(|e| e.attributes.is_directory()) {
                    return Err(Error::IsADirectory);
                }
                Mode::ReadWriteCreateOrTruncate
            };
            let file = dir.open_file_in_dir(name.as_str(), mode)?;
            csv::write_rows(rows, separator, |chunk| file.write(chunk))?;
            file.flush()?;
            debug!("sd: {} rows -> {}", rows.len(), target);
            Ok(())
        })
    }

    /// Stream the rows of a CSV file to `visit`. Returns the row count.
    pub fn read_csv<F>(&self, path: &str, separator: u8, mut visit: F) -> Result<usize, D::Error>
    where
        F: FnMut(CsvRow<'_>),
    {
        let (_, parent, name) = self.named(path)?;
        with_dir!(self, parent, |dir| {
            require_file(found(dir.find_directory_entry(name.as_str()))?)?;
            let file = dir.open_file_in_dir(name.as_str(), Mode::ReadOnly)?;

            let mut rows = 0;
            let mut on_line = |line: &[u8]| {
                if let Some(row) = CsvRow::new(line, separator) {
                    visit(row);
                    rows += 1;
                }
            };

            let mut lines = LineReader::new();
            let mut chunk = [0u8; 512];
            while !file.is_eof() {
                let n = file.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                lines.feed(&chunk[..n], &mut on_line);
            }
            lines.finish(&mut on_line);
            Ok(rows)
        })
    }

    // ---- json ----

    /// Create a file holding `value` as JSON. `buf` receives the encoded
    /// text; with `force`, missing parent directories are created first.
    pub fn create_json<V>(&self, path: &str, value: &V, buf: &mut [u8], force: bool) -> Result<(), D::Error>
    where
        V: Serialize + ?Sized,
    {
        let n = json::encode(value, buf)?;
        self.create_file_with(path, &buf[..n], force)
    }

    /// Replace the contents of `path` with `value` as JSON.
    pub fn write_json<V>(&self, path: &str, value: &V, buf: &mut [u8]) -> Result<(), D::Error>
    where
        V: Serialize + ?Sized,
    {
        let n = json::encode(value, buf)?;
        self.write_file(path, &buf[..n])
    }

    /// Decode the JSON document at `path`. The whole file must fit in
    /// `buf`; borrowed fields of `V` point into it.
    pub fn read_json<'b, V>(&self, path: &str, buf: &'b mut [u8]) -> Result<V, D::Error>
    where
        V: Deserialize<'b>,
    {
        let size = self.file_size(path)?;
        if size as usize > buf.len() {
            return Err(JsonError::TooLarge { size, cap: buf.len() }.into());
        }
        let n = self.read_file(path, buf)?;
        let data: &'b [u8] = buf;
        Ok(json::decode(&data[..n])?)
    }

    /// Read the document at `path`, let `edit` change it, write it back.
    /// The file must already exist.
    pub fn update_json<V, F>(&self, path: &str, buf: &mut [u8], edit: F) -> Result<(), D::Error>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce(&mut V),
    {
        let mut value: V = self.read_json(path, buf)?;
        edit(&mut value);
        self.write_json(path, &value, buf)
    }
}

// NotFound from a directory search becomes None
fn found<E: Debug>(
    res: core::result::Result<FatEntry, embedded_sdmmc::Error<E>>,
) -> Result<Option<FatEntry>, E> {
    match res {
        Ok(entry) => Ok(Some(entry)),
        Err(embedded_sdmmc::Error::NotFound) => Ok(None),
        Err(e) => Err(Error::Fs(e)),
    }
}

fn require_file<E: Debug>(entry: Option<FatEntry>) -> Result<FatEntry, E> {
    match entry {
        None => Err(Error::NotFound),
        Some(e) if e.attributes.is_directory() => Err(Error::IsADirectory),
        Some(e) => Ok(e),
    }
}
