// SD card over SPI and the block-device plumbing every volume operation
// goes through. No RTC on board; FAT timestamps come from the config date.

use embedded_sdmmc::{
    Block, BlockCount, BlockDevice, BlockIdx, SdCard, SdCardError, TimeSource, Timestamp,
};
use log::info;

use crate::config::FatDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTimeSource {
    date: FatDate,
}

impl FixedTimeSource {
    pub const fn new(date: FatDate) -> Self {
        Self { date }
    }
}

impl Default for FixedTimeSource {
    fn default() -> Self {
        Self::new(FatDate::new(2025, 1, 1))
    }
}

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        // the date may be set directly; FAT only stores 1980..=2107
        let mut date = self.date;
        date.sanitize();
        Timestamp {
            year_since_1970: (date.year - 1970) as u8,
            zero_indexed_month: date.month - 1,
            zero_indexed_day: date.day - 1,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

// Lends a block device to a short-lived VolumeManager. The wrapper keeps
// ownership of the device so raw FAT edits can reach it between calls.
pub(crate) struct DeviceRef<'a, D>(pub(crate) &'a D);

impl<D: BlockDevice> BlockDevice for DeviceRef<'_, D> {
    type Error = D::Error;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.0.read(blocks, start_block_idx)
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.0.write(blocks, start_block_idx)
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        self.0.num_blocks()
    }
}

/// Build the SD card driver and run the card init sequence.
pub fn init_card<SPI, DELAY>(spi: SPI, delay: DELAY) -> Result<SdCard<SPI, DELAY>, SdCardError>
where
    SPI: embedded_hal::spi::SpiDevice<u8>,
    DELAY: embedded_hal::delay::DelayNs,
{
    let sdcard = SdCard::new(spi, delay);

    // num_bytes triggers the SD init sequence (CMD0, CMD8, ACMD41, etc)
    let bytes = sdcard.num_bytes()?;
    info!("SD card: {} bytes ({} MB)", bytes, bytes / 1024 / 1024);

    Ok(sdcard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_follow_the_configured_date() {
        let ts = FixedTimeSource::new(FatDate::new(2024, 3, 9)).get_timestamp();
        assert_eq!(ts.year_since_1970, 54);
        assert_eq!(ts.zero_indexed_month, 2);
        assert_eq!(ts.zero_indexed_day, 8);
        assert_eq!(ts.hours, 0);
    }

    #[test]
    fn out_of_range_dates_are_clamped() {
        let ts = FixedTimeSource::new(FatDate::new(3000, 14, 40)).get_timestamp();
        assert_eq!(ts.year_since_1970, 137);
        assert_eq!(ts.zero_indexed_month, 11);
        assert_eq!(ts.zero_indexed_day, 30);

        let ts = FixedTimeSource::new(FatDate::new(1900, 0, 0)).get_timestamp();
        assert_eq!(ts.year_since_1970, 10);
        assert_eq!(ts.zero_indexed_month, 0);
        assert_eq!(ts.zero_indexed_day, 0);
    }
}
