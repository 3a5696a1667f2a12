// sdcard-utils demo firmware
//
// Mounts the card on SPI2 and walks through the utility API: create,
// rename, append, read back, CSV and JSON round trips, directories,
// cleanup.
// Every step is logged; the first failure is logged and the demo stops.
//
// Pin map (ESP32-C3 DevKitM-1 wiring):
// GPIO |  Function  |  Notes
//   6  | SPI2 SCK   |
//   7  | SPI2 MOSI  | card DI
//   2  | SPI2 MISO  | card DO, 10K pull-up on the module
//  10  | SD CS      | active low

#![no_std]
#![no_main]

use embedded_sdmmc::SdCardError;
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use sdcard_utils::board::{self, BoardSd};
use sdcard_utils::csv::DEFAULT_SEPARATOR;
use sdcard_utils::{DirEntry, Error, SdConfig};

esp_bootloader_esp_idf::esp_app_desc!();

// operating clock once the card is up; init always runs at 400 kHz
const SD_FREQ_HZ: u32 = 1_000_000;

const LIST_CAP: usize = 16;

#[derive(Serialize, Deserialize)]
struct Person<'a> {
    name: &'a str,
    age: u8,
}

// kept on the card across resets
#[derive(Serialize, Deserialize)]
struct BootCount {
    boots: u32,
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger_from_env();
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    let sd_config = SdConfig::defaults().with_frequency_hz(SD_FREQ_HZ);
    match board::mount_sd(
        peripherals.SPI2,
        peripherals.GPIO6,
        peripherals.GPIO7,
        peripherals.GPIO2,
        peripherals.GPIO10,
        &sd_config,
    ) {
        Ok(mut sd) => {
            if let Err(e) = demo(&mut sd) {
                warn!("demo stopped: {} ({:?})", e, e.kind());
            }
            sd.unmount();
        }
        Err(e) => warn!("no SD card: {}", e),
    }

    info!("done");
    loop {
        core::hint::spin_loop();
    }
}

fn list(sd: &BoardSd, path: &str) -> Result<(), Error<SdCardError>> {
    let mut entries = [DirEntry::EMPTY; LIST_CAP];
    let page = sd.list(path, &mut entries)?;
    info!("list {} ({} entries)", path, page.total);
    for e in &entries[..page.count] {
        if e.is_dir {
            info!("  {}/", e.name());
        } else {
            info!("  {} {}", e.name(), e.size);
        }
    }
    Ok(())
}

fn demo(sd: &mut BoardSd) -> Result<(), Error<SdCardError>> {
    info!("start in {}{}", sd.mount_path(), sd.cwd());
    info!("free: {} KiB", sd.free_bytes()? / 1024);

    sd.create_file("prueba.txt")?;
    info!("created prueba.txt");
    list(sd, ".")?;

    sd.rename("prueba.txt", "prueba1.doc")?;
    info!("renamed prueba.txt -> prueba1.doc");
    list(sd, ".")?;

    sd.update_file("prueba1.doc", b"Hi")?;
    sd.update_file("prueba1.doc", b"world")?;
    let mut buf = [0u8; 64];
    let n = sd.read_file("prueba1.doc", &mut buf)?;
    info!("prueba1.doc: {:?}", core::str::from_utf8(&buf[..n]));

    sd.delete_file("prueba1.doc")?;
    info!("deleted prueba1.doc");
    list(sd, ".")?;

    sd.create_dir("/sd4")?;
    info!("created /sd4");
    sd.cd("/sd4", false)?;
    sd.cd("other", true)?;
    info!("cwd {}", sd.cwd());
    list(sd, ".")?;
    sd.cd("/", false)?;

    let rows: &[&[&str]] = &[
        &["nombre", "edad", "activo"],
        &["John", "22", "True"],
        &["Nataly", "28", "False"],
        &["Eva", "18", "True"],
        &["Steve", "44", "True"],
    ];
    sd.write_csv("prueba.csv", rows, DEFAULT_SEPARATOR)?;
    let count = sd.read_csv("prueba.csv", DEFAULT_SEPARATOR, |row| {
        let mut fields = row.fields();
        let name = fields.next().unwrap_or("");
        let age = fields.next().unwrap_or("");
        info!("  {:<8} {}", name, age);
    })?;
    info!("prueba.csv: {} rows", count);

    sd.delete_file("prueba.csv")?;

    let mut json_buf = [0u8; 128];
    let john = Person { name: "John", age: 12 };
    sd.create_json("prueba.jsn", &john, &mut json_buf, false)?;
    let person: Person = sd.read_json("prueba.jsn", &mut json_buf)?;
    info!("prueba.jsn: {} is {}", person.name, person.age);
    sd.delete_file("prueba.jsn")?;

    if !sd.exists("boots.jsn")? {
        sd.create_json("boots.jsn", &BootCount { boots: 0 }, &mut json_buf, false)?;
    }
    sd.update_json("boots.jsn", &mut json_buf, |b: &mut BootCount| b.boots += 1)?;
    let count: BootCount = sd.read_json("boots.jsn", &mut json_buf)?;
    info!("boot #{}", count.boots);

    sd.delete_dir_all("/sd4")?;
    info!("removed /sd4");
    list(sd, "/")?;

    Ok(())
}
