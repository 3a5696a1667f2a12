// SD card bring-up settings: where the volume is mounted, how the SPI bus
// is clocked, and the date stamped on FAT entries (no RTC on board).

use core::fmt;

use embedded_hal::spi::{MODE_0, Mode};

pub const DEFAULT_MOUNT_PATH: &str = "/sd";

// sd card initialization frequency (Hz); the card must be brought up slow
pub const SD_INIT_FREQ_HZ: u32 = 400_000;

// operating frequency after init
pub const DEFAULT_FREQ_HZ: u32 = 1_000_000;

// SD default-speed ceiling in SPI mode
pub const MAX_FREQ_HZ: u32 = 25_000_000;

// SD cards only speak 8-bit SPI frames
pub const WORD_BITS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Mount path must be absolute and must not end in `/` (except `/`).
    MountPath,
    /// Unsupported SPI word size.
    WordSize(u8),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MountPath => f.write_str("mount path must look like /sd"),
            ConfigError::WordSize(bits) => write!(f, "{}-bit SPI words are not supported", bits),
        }
    }
}

/// Calendar date written into FAT timestamps; month and day are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl FatDate {
    // FAT dates span 1980..=2107
    pub const MIN_YEAR: u16 = 1980;
    pub const MAX_YEAR: u16 = 2107;

    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    pub(crate) fn sanitize(&mut self) {
        self.year = self.year.clamp(Self::MIN_YEAR, Self::MAX_YEAR);
        self.month = self.month.clamp(1, 12);
        self.day = self.day.clamp(1, 31);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdConfig {
    pub mount_path: &'static str,
    pub init_frequency_hz: u32,
    pub frequency_hz: u32,
    pub mode: Mode,
    pub bits: u8,
    pub date: FatDate,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl SdConfig {
    pub const fn defaults() -> Self {
        Self {
            mount_path: DEFAULT_MOUNT_PATH,
            init_frequency_hz: SD_INIT_FREQ_HZ,
            frequency_hz: DEFAULT_FREQ_HZ,
            mode: MODE_0,
            bits: WORD_BITS,
            date: FatDate::new(2025, 1, 1),
        }
    }

    pub const fn with_mount_path(mut self, mount_path: &'static str) -> Self {
        self.mount_path = mount_path;
        self
    }

    pub const fn with_frequency_hz(mut self, hz: u32) -> Self {
        self.frequency_hz = hz;
        self
    }

    pub const fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub const fn with_bits(mut self, bits: u8) -> Self {
        self.bits = bits;
        self
    }

    pub const fn with_date(mut self, date: FatDate) -> Self {
        self.date = date;
        self
    }

    /// Pull numeric settings back into the range the card tolerates.
    pub fn sanitize(&mut self) {
        self.init_frequency_hz = self.init_frequency_hz.clamp(100_000, SD_INIT_FREQ_HZ);
        self.frequency_hz = self.frequency_hz.clamp(self.init_frequency_hz, MAX_FREQ_HZ);
        self.date.sanitize();
    }

    /// Reject settings that cannot be clamped into something sensible.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let path = self.mount_path;
        let well_formed =
            path == "/" || (path.len() > 1 && path.starts_with('/') && !path.ends_with('/'));
        if !well_formed {
            return Err(ConfigError::MountPath);
        }
        if self.bits != WORD_BITS {
            return Err(ConfigError::WordSize(self.bits));
        }
        Ok(())
    }
}
