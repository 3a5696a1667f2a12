//! Formatting cards as FAT16 and FAT32

mod common;

use common::{FAT32_DISK_BLOCKS, RamDisk, fill, mounted_fat32, names, read_all};
use sdcard_utils::{ErrorKind, FatType, SdCardUtils, SdConfig, format, format_as};

#[test]
fn small_cards_get_fat16() {
    let disk = RamDisk::new(common::DISK_BLOCKS);
    let layout = format(&disk, "SMALL").unwrap();
    assert_eq!(layout.fat_type, FatType::Fat16);
    assert_eq!(layout.partition_start, 2048);
    assert!(layout.cluster_count >= 4085 && layout.cluster_count < 65525);
}

#[test]
fn fat32_volume_works_end_to_end() {
    let disk = RamDisk::new(FAT32_DISK_BLOCKS);
    let layout = format_as(&disk, FatType::Fat32, "BIG").unwrap();
    assert_eq!(layout.fat_type, FatType::Fat32);
    assert!(layout.cluster_count >= 65525);

    let mut sd = SdCardUtils::mount(disk, &SdConfig::defaults()).unwrap();
    assert_eq!(sd.fat_type().unwrap(), FatType::Fat32);

    sd.cd("LOGS", true).unwrap();
    sd.write_file("DAY1.TXT", b"fat32").unwrap();
    sd.create_dir("OLD").unwrap();
    sd.create_file("OLD/A.TXT").unwrap();
    sd.cd("/", false).unwrap();
    assert_eq!(read_all(&sd, "LOGS/DAY1.TXT"), b"fat32");

    sd.rename("LOGS", "ARCHIVE").unwrap();
    assert_eq!(names(&sd, "ARCHIVE"), ["DAY1.TXT", "OLD"]);

    sd.delete_dir_all("ARCHIVE").unwrap();
    assert!(names(&sd, "/").is_empty());

    sd.create_dir("NEW").unwrap();
    assert_eq!(names(&sd, "/"), ["NEW"]);
}

#[test]
fn requested_type_must_fit() {
    let disk = RamDisk::new(common::DISK_BLOCKS);
    let err = format_as(&disk, FatType::Fat32, "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let tiny = RamDisk::new(64);
    assert_eq!(format(&tiny, "").unwrap_err().kind(), ErrorKind::Unsupported);
}

#[test]
fn reformat_clears_the_card() {
    let sd = common::mounted();
    sd.write_file("OLD.TXT", b"old").unwrap();
    let disk = sd.unmount();

    format(&disk, "").unwrap();
    let sd = SdCardUtils::mount(disk, &SdConfig::defaults()).unwrap();
    assert!(!sd.exists("OLD.TXT").unwrap());
}

#[test]
fn removed_card_cannot_be_formatted() {
    let disk = RamDisk::new(common::DISK_BLOCKS);
    disk.remove();
    assert_eq!(format(&disk, "").unwrap_err().kind(), ErrorKind::Io);
}

// the card is full, nothing panicked, and deleting makes room again
fn check_full_card(sd: &SdCardUtils<RamDisk>, at_least: usize) {
    let (written, err) = fill(sd);
    assert_eq!(err.kind(), ErrorKind::StorageFull, "{err}");
    assert!(written >= at_least, "only {written} MiB fit");
    assert_eq!(sd.free_clusters().unwrap(), 0);

    let partial = format!("F{:02}.DAT", written);
    if sd.exists(&partial).unwrap() {
        sd.delete_file(&partial).unwrap();
    }
    sd.delete_file("F00.DAT").unwrap();
    assert!(sd.free_bytes().unwrap() >= 1 << 20);

    sd.write_file("AGAIN.DAT", &[1u8; 4096]).unwrap();
    assert_eq!(read_all(sd, "AGAIN.DAT"), [1u8; 4096]);
}

#[test]
fn full_fat16_card_reports_storage_full() {
    let sd = common::mounted();
    check_full_card(&sd, 13);
}

#[test]
fn full_fat32_card_reports_storage_full() {
    let sd = mounted_fat32();
    check_full_card(&sd, 36);
}

#[test]
fn fat32_free_count_comes_back_after_deletes() {
    let sd = mounted_fat32();
    let free = sd.free_clusters().unwrap();
    let recorded = sd.device().fsinfo_free_count();
    assert_eq!(recorded, free);

    sd.create_dir_all("LOGS/OLD").unwrap();
    sd.create_dir("EMPTY").unwrap();
    sd.write_file("LOGS/OLD/A.DAT", &[3u8; 100_000]).unwrap();
    sd.write_file("LOGS/B.DAT", &[4u8; 20_000]).unwrap();
    sd.write_file("C.DAT", &[5u8; 3000]).unwrap();
    let used = recorded - sd.device().fsinfo_free_count();
    assert!(used >= (100_000 + 20_000 + 3000) / 512, "{used} clusters");
    assert_eq!(sd.device().fsinfo_free_count(), sd.free_clusters().unwrap());

    sd.delete_file("C.DAT").unwrap();
    sd.delete_dir("EMPTY").unwrap();
    sd.delete_dir_all("LOGS").unwrap();
    assert_eq!(sd.device().fsinfo_free_count(), recorded);
    assert_eq!(sd.free_clusters().unwrap(), free);
}
