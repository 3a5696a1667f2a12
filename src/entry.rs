// Directory listing entries, copied out of the FAT directory so they
// outlive the volume handles they were read through.

use core::fmt;

use embedded_sdmmc::ShortFileName;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    name: [u8; 12],
    name_len: u8,
    pub is_dir: bool,
    pub size: u32,
}

impl DirEntry {
    pub const EMPTY: Self = Self {
        name: [0u8; 12],
        name_len: 0,
        is_dir: false,
        size: 0,
    };

    pub(crate) const ROOT: Self = Self {
        name: *b"/           ",
        name_len: 1,
        is_dir: true,
        size: 0,
    };

    pub(crate) fn from_fat(entry: &embedded_sdmmc::DirEntry) -> Self {
        let mut name = [0u8; 12];
        let name_len = format_83_name(&entry.name, &mut name);
        Self {
            name,
            name_len: name_len as u8,
            is_dir: entry.attributes.is_directory(),
            size: entry.size,
        }
    }

    // 8.3 filename, "NAME.EXT"
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("?")
    }
}

impl fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntry")
            .field("name", &self.name())
            .field("is_dir", &self.is_dir)
            .field("size", &self.size)
            .finish()
    }
}

/// How many entries a listing copied out, and how many the directory had.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirPage {
    pub total: usize,
    pub count: usize,
}

// entries a listing shows: no ".", "..", volume labels or long-name slots
pub(crate) fn is_listed(entry: &embedded_sdmmc::DirEntry) -> bool {
    if entry.attributes.is_volume() || entry.attributes.is_lfn() {
        return false;
    }
    !matches!(entry.name.base_name().first(), Some(b'.') | None)
}

fn format_83_name(sfn: &ShortFileName, out: &mut [u8; 12]) -> usize {
    let base = sfn.base_name();
    let ext = sfn.extension();

    let mut pos = 0;

    for &b in base.iter() {
        if b == b' ' {
            break;
        }
        out[pos] = b;
        pos += 1;
    }

    let ext_trimmed: &[u8] = &ext[..ext.iter().position(|&b| b == b' ').unwrap_or(ext.len())];
    if !ext_trimmed.is_empty() {
        out[pos] = b'.';
        pos += 1;
        for &b in ext_trimmed {
            out[pos] = b;
            pos += 1;
        }
    }

    pos
}
