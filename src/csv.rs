// Semicolon-separated rows on top of plain files.
//
// No quoting: a field must not contain the separator or a newline.
// Reading streams the file through a fixed line buffer; lines longer
// than LINE_CAP are skipped.

use log::warn;

pub const DEFAULT_SEPARATOR: u8 = b';';

// longest line read_csv hands to the visitor
pub const LINE_CAP: usize = 256;

// bytes collected before a write hits the file
const CHUNK_CAP: usize = 512;

/// One parsed line of a CSV file.
#[derive(Debug, Clone, Copy)]
pub struct CsvRow<'a> {
    line: &'a str,
    separator: char,
}

impl<'a> CsvRow<'a> {
    pub(crate) fn new(line: &'a [u8], separator: u8) -> Option<Self> {
        match core::str::from_utf8(line) {
            Ok(line) => Some(Self {
                line,
                separator: separator as char,
            }),
            Err(_) => {
                warn!("csv: skipped line that is not UTF-8");
                None
            }
        }
    }

    /// The whole line without its terminator.
    pub fn as_str(&self) -> &'a str {
        self.line
    }

    pub fn fields(&self) -> core::str::Split<'a, char> {
        self.line.split(self.separator)
    }

    pub fn field(&self, idx: usize) -> Option<&'a str> {
        self.fields().nth(idx)
    }
}

// Splits a byte stream into '\n'-terminated lines.
pub(crate) struct LineReader {
    buf: [u8; LINE_CAP],
    len: usize,
    overflow: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0u8; LINE_CAP],
            len: 0,
            overflow: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8], mut on_line: impl FnMut(&[u8])) {
        for &b in chunk {
            if b == b'\n' {
                self.emit(&mut on_line);
            } else if self.len < LINE_CAP {
                self.buf[self.len] = b;
                self.len += 1;
            } else {
                self.overflow = true;
            }
        }
    }

    // last line may lack its newline
    pub fn finish(&mut self, mut on_line: impl FnMut(&[u8])) {
        if self.len > 0 || self.overflow {
            self.emit(&mut on_line);
        }
    }

    fn emit(&mut self, on_line: &mut impl FnMut(&[u8])) {
        if self.overflow {
            warn!("csv: skipped line longer than {} bytes", LINE_CAP);
        } else {
            let line = &self.buf[..self.len];
            on_line(line.strip_suffix(b"\r").unwrap_or(line));
        }
        self.len = 0;
        self.overflow = false;
    }
}

// Collects small writes into one buffer so each file write covers many fields.
struct ChunkWriter {
    buf: [u8; CHUNK_CAP],
    len: usize,
}

impl ChunkWriter {
    const fn new() -> Self {
        Self {
            buf: [0u8; CHUNK_CAP],
            len: 0,
        }
    }

    fn push<E>(
        &mut self,
        mut bytes: &[u8],
        sink: &mut impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        while !bytes.is_empty() {
            if self.len == CHUNK_CAP {
                self.flush(sink)?;
            }
            let n = (CHUNK_CAP - self.len).min(bytes.len());
            self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn flush<E>(&mut self, sink: &mut impl FnMut(&[u8]) -> Result<(), E>) -> Result<(), E> {
        if self.len > 0 {
            sink(&self.buf[..self.len])?;
            self.len = 0;
        }
        Ok(())
    }
}

/// Encode `rows` as separator-joined lines and hand them to `sink` in chunks.
pub fn write_rows<E>(
    rows: &[&[&str]],
    separator: u8,
    mut sink: impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    let mut out = ChunkWriter::new();
    for row in rows {
        for (i, field) in row.iter().enumerate() {
            if i > 0 {
                out.push(&[separator], &mut sink)?;
            }
            out.push(field.as_bytes(), &mut sink)?;
        }
        out.push(b"\n", &mut sink)?;
    }
    out.flush(&mut sink)
}
