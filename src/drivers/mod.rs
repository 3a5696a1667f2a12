// Block-level drivers: the SD card over SPI, raw FAT directory edits
// the volume manager does not offer, and the FAT16/FAT32 formatter.

pub mod fat;
pub mod format;
pub mod sdcard;
