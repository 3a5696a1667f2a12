//! ESP32-C3 SD card bring-up
//!
//! Turns an SPI peripheral and four pins into a mounted `SdCardUtils`.
//! The card is initialized at `init_frequency_hz` (cards must come up
//! at <= 400 kHz), then the bus is switched to `frequency_hz`.
//! Pin numbers are the caller's business; see the pin map in the
//! firmware binary.

use core::fmt;

use embedded_hal::spi::{Phase, Polarity};
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::{SdCard, SdCardError};
use esp_hal::{
    Blocking,
    delay::Delay,
    gpio::{
        Level, Output, OutputConfig, OutputPin,
        interconnect::{PeripheralInput, PeripheralOutput},
    },
    spi,
    time::Rate,
};
use log::{info, warn};

use crate::config::SdConfig;
use crate::error::Error;
use crate::storage::SdCardUtils;

// Type Aliases
pub type SpiBus = spi::master::Spi<'static, Blocking>;
pub type SdSpiDevice = ExclusiveDevice<SpiBus, Output<'static>, Delay>;
pub type BoardCard = SdCard<SdSpiDevice, Delay>;
pub type BoardSd = SdCardUtils<BoardCard>;

#[derive(Debug)]
pub enum BoardError {
    /// The SPI peripheral rejected the bus settings.
    Spi(spi::master::ConfigError),
    /// Card init or mount failed.
    Sd(Error<SdCardError>),
}

impl fmt::Display for BoardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardError::Spi(e) => write!(f, "SPI config rejected: {:?}", e),
            BoardError::Sd(e) => write!(f, "SD card: {}", e),
        }
    }
}

impl From<Error<SdCardError>> for BoardError {
    fn from(e: Error<SdCardError>) -> Self {
        BoardError::Sd(e)
    }
}

fn spi_mode(mode: embedded_hal::spi::Mode) -> spi::Mode {
    match (mode.polarity, mode.phase) {
        (Polarity::IdleLow, Phase::CaptureOnFirstTransition) => spi::Mode::_0,
        (Polarity::IdleLow, Phase::CaptureOnSecondTransition) => spi::Mode::_1,
        (Polarity::IdleHigh, Phase::CaptureOnFirstTransition) => spi::Mode::_2,
        (Polarity::IdleHigh, Phase::CaptureOnSecondTransition) => spi::Mode::_3,
    }
}

fn spi_config(hz: u32, config: &SdConfig) -> spi::master::Config {
    spi::master::Config::default()
        .with_frequency(Rate::from_hz(hz))
        .with_mode(spi_mode(config.mode))
}

/// Configure `bus` as an SPI master on the given pins, bring up the card
/// and mount its first FAT volume.
pub fn mount_sd(
    bus: impl spi::master::Instance + 'static,
    sck: impl PeripheralOutput<'static>,
    mosi: impl PeripheralOutput<'static>,
    miso: impl PeripheralInput<'static>,
    cs: impl OutputPin + 'static,
    config: &SdConfig,
) -> Result<BoardSd, BoardError> {
    let mut config = *config;
    config.sanitize();
    config.validate().map_err(|e| BoardError::Sd(e.into()))?;

    // cs idles high so the card ignores the bus until selected
    let cs = Output::new(cs, Level::High, OutputConfig::default());

    let spi_bus = spi::master::Spi::new(bus, spi_config(config.init_frequency_hz, &config))
        .map_err(BoardError::Spi)?
        .with_sck(sck)
        .with_mosi(mosi)
        .with_miso(miso);

    let Ok(spi_dev) = ExclusiveDevice::new(spi_bus, cs, Delay::new());

    let sd = SdCardUtils::from_spi(spi_dev, Delay::new(), &config)?;

    let fast = spi_config(config.frequency_hz, &config);
    if let Err(e) = sd.device().spi(|dev| dev.bus_mut().apply_config(&fast)) {
        warn!("SD: staying at {} Hz, {:?}", config.init_frequency_hz, e);
    } else {
        info!("SD: bus at {} Hz", config.frequency_hz);
    }

    Ok(sd)
}
