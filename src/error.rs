//! Error type shared by every SD card operation.
//!
//! Failures from the filesystem and the block device are carried unchanged;
//! the variants without a payload are conditions this crate checks itself
//! before calling into the filesystem. [`Error::kind`] folds both into one
//! classification.

use core::fmt;

use crate::config::ConfigError;
use crate::json::JsonError;
use crate::path::PathError;

/// Result type for SD card operations on a block device with error `E`.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

#[derive(Debug)]
pub enum Error<E: fmt::Debug> {
    /// The card could not be initialized or volume 0 could not be opened.
    Mount(embedded_sdmmc::Error<E>),
    /// Error raised by the FAT filesystem layer.
    Fs(embedded_sdmmc::Error<E>),
    /// Error raised by the block device during a raw FAT edit.
    Device(E),
    AlreadyExists,
    NotFound,
    DirectoryNotEmpty,
    NotADirectory,
    IsADirectory,
    Path(PathError),
    Config(ConfigError),
    Json(JsonError),
    /// On-disk structures that do not parse.
    Corrupt(&'static str),
    /// The formatter refused the device.
    Format(&'static str),
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Mount,
    NotFound,
    AlreadyExists,
    DirectoryNotEmpty,
    NotADirectory,
    IsADirectory,
    InvalidPath,
    InvalidConfig,
    InvalidData,
    StorageFull,
    Unsupported,
    Io,
}

impl<E: fmt::Debug> Error<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Mount(_) => ErrorKind::Mount,
            Error::Fs(e) => fs_kind(e),
            Error::Device(_) | Error::Corrupt(_) => ErrorKind::Io,
            Error::AlreadyExists => ErrorKind::AlreadyExists,
            Error::NotFound => ErrorKind::NotFound,
            Error::DirectoryNotEmpty => ErrorKind::DirectoryNotEmpty,
            Error::NotADirectory => ErrorKind::NotADirectory,
            Error::IsADirectory => ErrorKind::IsADirectory,
            Error::Path(_) => ErrorKind::InvalidPath,
            Error::Config(_) => ErrorKind::InvalidConfig,
            Error::Json(_) => ErrorKind::InvalidData,
            Error::Format(_) => ErrorKind::Unsupported,
        }
    }
}

fn fs_kind<E: fmt::Debug>(e: &embedded_sdmmc::Error<E>) -> ErrorKind {
    use embedded_sdmmc::Error as FsError;

    match e {
        FsError::NotFound => ErrorKind::NotFound,
        FsError::FileAlreadyExists | FsError::DirAlreadyExists => ErrorKind::AlreadyExists,
        FsError::OpenedDirAsFile | FsError::DeleteDirAsFile => ErrorKind::IsADirectory,
        FsError::OpenedFileAsDir => ErrorKind::NotADirectory,
        FsError::FilenameError(_) => ErrorKind::InvalidPath,
        FsError::NotEnoughSpace | FsError::DiskFull => ErrorKind::StorageFull,
        _ => ErrorKind::Io,
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mount(e) => write!(f, "mount failed: {:?}", e),
            Error::Fs(e) => write!(f, "filesystem error: {:?}", e),
            Error::Device(e) => write!(f, "block device error: {:?}", e),
            Error::AlreadyExists => f.write_str("already exists"),
            Error::NotFound => f.write_str("not found"),
            Error::DirectoryNotEmpty => f.write_str("directory not empty"),
            Error::NotADirectory => f.write_str("not a directory"),
            Error::IsADirectory => f.write_str("is a directory"),
            Error::Path(e) => write!(f, "invalid path: {}", e),
            Error::Config(e) => write!(f, "invalid config: {}", e),
            Error::Json(e) => write!(f, "json {}", e),
            Error::Corrupt(what) => write!(f, "corrupt volume: {}", what),
            Error::Format(what) => write!(f, "cannot format: {}", what),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for Error<E> {}

impl<E: fmt::Debug> From<embedded_sdmmc::Error<E>> for Error<E> {
    fn from(e: embedded_sdmmc::Error<E>) -> Self {
        Error::Fs(e)
    }
}

impl<E: fmt::Debug> From<PathError> for Error<E> {
    fn from(e: PathError) -> Self {
        Error::Path(e)
    }
}

impl<E: fmt::Debug> From<ConfigError> for Error<E> {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl<E: fmt::Debug> From<JsonError> for Error<E> {
    fn from(e: JsonError) -> Self {
        Error::Json(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_errors_keep_their_payload_and_get_a_kind() {
        let e: Error<()> = embedded_sdmmc::Error::NotFound.into();
        assert!(matches!(e, Error::Fs(embedded_sdmmc::Error::NotFound)));
        assert_eq!(e.kind(), ErrorKind::NotFound);

        let e: Error<()> = embedded_sdmmc::Error::OpenedFileAsDir.into();
        assert_eq!(e.kind(), ErrorKind::NotADirectory);

        let e: Error<()> = embedded_sdmmc::Error::DeviceError(()).into();
        assert_eq!(e.kind(), ErrorKind::Io);

        let e: Error<()> = embedded_sdmmc::Error::NotEnoughSpace.into();
        assert_eq!(e.kind(), ErrorKind::StorageFull);
    }

    #[test]
    fn local_conditions() {
        assert_eq!(Error::<()>::DirectoryNotEmpty.kind(), ErrorKind::DirectoryNotEmpty);
        assert_eq!(Error::<()>::from(PathError::Empty).kind(), ErrorKind::InvalidPath);
        assert_eq!(
            format!("{}", Error::<()>::Path(PathError::TooDeep)),
            "invalid path: path too deep"
        );
        let e = Error::<()>::from(JsonError::TooLarge { size: 900, cap: 512 });
        assert_eq!(e.kind(), ErrorKind::InvalidData);
        assert_eq!(format!("{}", e), "json document of 900 bytes exceeds 512 byte buffer");
    }
}
