//! CSV files on the card

mod common;

use common::{mounted, read_all};
use sdcard_utils::ErrorKind;
use sdcard_utils::csv::DEFAULT_SEPARATOR;

const PEOPLE: &[&[&str]] = &[
    &["nombre", "edad", "activo"],
    &["John", "22", "True"],
    &["Nataly", "28", "False"],
    &["Eva", "18", "True"],
    &["Steve", "44", "True"],
];

fn read_rows(sd: &sdcard_utils::SdCardUtils<common::RamDisk>, path: &str, sep: u8) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let count = sd
        .read_csv(path, sep, |row| {
            rows.push(row.fields().map(str::to_string).collect::<Vec<_>>())
        })
        .unwrap();
    assert_eq!(count, rows.len());
    rows
}

#[test]
fn rows_survive_a_write_and_read() {
    let sd = mounted();
    sd.write_csv("prueba.csv", PEOPLE, DEFAULT_SEPARATOR).unwrap();
    assert_eq!(
        read_all(&sd, "prueba.csv"),
        b"nombre;edad;activo\nJohn;22;True\nNataly;28;False\nEva;18;True\nSteve;44;True\n"
    );

    let rows = read_rows(&sd, "prueba.csv", DEFAULT_SEPARATOR);
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0], ["nombre", "edad", "activo"]);
    assert_eq!(rows[3], ["Eva", "18", "True"]);
}

#[test]
fn write_csv_replaces_and_update_csv_appends() {
    let sd = mounted();
    sd.write_csv("LOG.CSV", &[&["old", "row"]], b',').unwrap();
    sd.write_csv("LOG.CSV", &[&["t", "v"]], b',').unwrap();
    sd.update_csv("LOG.CSV", &[&["1", "20.5"], &["2", "21.0"]], b',').unwrap();

    let rows = read_rows(&sd, "LOG.CSV", b',');
    assert_eq!(rows, [vec!["t", "v"], vec!["1", "20.5"], vec!["2", "21.0"]]);
}

#[test]
fn many_rows_cross_block_boundaries() {
    let sd = mounted();
    let numbers: Vec<String> = (0..300).map(|i| i.to_string()).collect();
    let rows: Vec<[&str; 3]> = numbers.iter().map(|n| [n.as_str(), "sensor", "ok"]).collect();
    let refs: Vec<&[&str]> = rows.iter().map(|r| &r[..]).collect();
    sd.write_csv("/sd/DATA.CSV", &refs, DEFAULT_SEPARATOR).unwrap();

    let read = read_rows(&sd, "DATA.CSV", DEFAULT_SEPARATOR);
    assert_eq!(read.len(), 300);
    assert_eq!(read[299], ["299", "sensor", "ok"]);
}

#[test]
fn csv_errors() {
    let sd = mounted();
    sd.create_dir("DIR").unwrap();
    let err = sd.update_csv("NEW.CSV", PEOPLE, DEFAULT_SEPARATOR).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = sd.read_csv("NEW.CSV", DEFAULT_SEPARATOR, |_| {}).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = sd.write_csv("DIR", PEOPLE, DEFAULT_SEPARATOR).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IsADirectory);
}
