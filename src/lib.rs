// File and directory utilities for a FAT-formatted SD card on an SPI bus

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "esp32c3")]
pub mod board;
pub mod config;
pub mod csv;
pub mod drivers;
pub mod entry;
pub mod error;
pub mod json;
pub mod path;
pub mod storage;

pub use config::{FatDate, SdConfig};
pub use drivers::fat::FatType;
pub use drivers::format::{Layout, format, format_as};
pub use drivers::sdcard::FixedTimeSource;
pub use entry::{DirEntry, DirPage};
pub use error::{Error, ErrorKind};
pub use json::JsonError;
pub use path::{DirPath, PathError};
pub use storage::SdCardUtils;
