// Path resolution for the mounted volume.
//
// Paths are resolved into a fixed-depth stack of validated 8.3 names so
// nothing here needs an allocator. Names are upper-cased: FAT short names
// compare case-insensitively and embedded-sdmmc stores them upper case.

use core::fmt;

// deepest directory nesting we resolve
pub const MAX_DEPTH: usize = 8;

// "NAME.EXT": 8 + 1 + 3
pub const NAME_CAP: usize = 12;

const BASE_CAP: usize = 8;
const EXT_CAP: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// Empty path string.
    Empty,
    /// A component is not a valid 8.3 short name.
    InvalidName,
    /// More than [`MAX_DEPTH`] components.
    TooDeep,
    /// `..` walked above the volume root.
    AboveRoot,
    /// The operation needs a named entry but the path is the volume root.
    Root,
    /// Rename source and target live in different directories.
    CrossDirectory,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PathError::Empty => "empty path",
            PathError::InvalidName => "not a valid 8.3 name",
            PathError::TooDeep => "path too deep",
            PathError::AboveRoot => "path escapes the volume root",
            PathError::Root => "path names the volume root",
            PathError::CrossDirectory => "rename across directories",
        })
    }
}

/// A validated, upper-cased 8.3 file name such as `PRUEBA1.DOC`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    buf: [u8; NAME_CAP],
    len: u8,
}

impl ShortName {
    pub const EMPTY: Self = Self {
        buf: [0u8; NAME_CAP],
        len: 0,
    };

    pub fn parse(s: &str) -> Result<Self, PathError> {
        let bytes = s.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_CAP || bytes[0] == b'.' {
            return Err(PathError::InvalidName);
        }

        let (base, ext) = match bytes.iter().position(|&b| b == b'.') {
            Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
            None => (bytes, &bytes[..0]),
        };
        if base.is_empty() || base.len() > BASE_CAP || ext.len() > EXT_CAP {
            return Err(PathError::InvalidName);
        }
        // a second dot lands in ext and fails here
        if !base.iter().chain(ext.iter()).all(|&b| is_name_byte(b)) {
            return Err(PathError::InvalidName);
        }
        // "NAME." has an empty extension; store it without the dot
        let len = if ext.is_empty() { base.len() } else { bytes.len() };

        let mut buf = [0u8; NAME_CAP];
        for (dst, &src) in buf.iter_mut().zip(&bytes[..len]) {
            *dst = src.to_ascii_uppercase();
        }
        Ok(Self {
            buf,
            len: len as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        // only ASCII ever gets in
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }

    /// The 11-byte space-padded form stored in a FAT directory entry.
    pub fn fat_bytes(&self) -> [u8; 11] {
        let mut out = [b' '; 11];
        let name = &self.buf[..self.len as usize];
        let (base, ext) = match name.iter().position(|&b| b == b'.') {
            Some(dot) => (&name[..dot], &name[dot + 1..]),
            None => (name, &name[..0]),
        };
        out[..base.len()].copy_from_slice(base);
        out[8..8 + ext.len()].copy_from_slice(ext);
        out
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'-' | b'@' | b'^' | b'_'
                | b'`' | b'{' | b'}' | b'~'
        )
}

/// A directory or file location inside the volume, root first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DirPath {
    parts: [ShortName; MAX_DEPTH],
    depth: u8,
}

impl Default for DirPath {
    fn default() -> Self {
        Self::ROOT
    }
}

impl DirPath {
    pub const ROOT: Self = Self {
        parts: [ShortName::EMPTY; MAX_DEPTH],
        depth: 0,
    };

    /// Resolve `input` against `cwd`.
    ///
    /// Absolute paths under `mount` (`/sd/LOG.TXT`) and other absolute
    /// paths (`/LOG.TXT`) both start at the volume root; relative paths
    /// start at `cwd`. `.` and `..` are folded lexically.
    pub fn resolve(cwd: &DirPath, mount: &str, input: &str) -> Result<Self, PathError> {
        if input.is_empty() {
            return Err(PathError::Empty);
        }

        let (mut path, rest) = match strip_mount(mount, input) {
            Some(rest) => (Self::ROOT, rest),
            None if input.starts_with('/') => (Self::ROOT, input),
            None => (*cwd, input),
        };

        for comp in rest.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    path.pop().ok_or(PathError::AboveRoot)?;
                }
                name => path.push(ShortName::parse(name)?)?,
            }
        }
        Ok(path)
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    pub fn components(&self) -> &[ShortName] {
        &self.parts[..self.depth as usize]
    }

    pub fn push(&mut self, name: ShortName) -> Result<(), PathError> {
        if self.depth as usize >= MAX_DEPTH {
            return Err(PathError::TooDeep);
        }
        self.parts[self.depth as usize] = name;
        self.depth += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<ShortName> {
        if self.depth == 0 {
            return None;
        }
        self.depth -= 1;
        let name = self.parts[self.depth as usize];
        self.parts[self.depth as usize] = ShortName::EMPTY;
        Some(name)
    }

    /// Parent directory and final name; `None` for the root.
    pub fn split_last(&self) -> Option<(DirPath, ShortName)> {
        let mut parent = *self;
        let name = parent.pop()?;
        Some((parent, name))
    }

    /// The first `depth` components.
    pub fn prefix(&self, depth: usize) -> DirPath {
        let mut out = Self::ROOT;
        let n = depth.min(self.depth as usize);
        out.parts[..n].copy_from_slice(&self.parts[..n]);
        out.depth = n as u8;
        out
    }
}

impl fmt::Display for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for part in self.components() {
            write!(f, "/{}", part)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirPath({})", self)
    }
}

// "/sd" matches "/sd" and "/sd/..." but not "/sdx"
fn strip_mount<'a>(mount: &str, input: &'a str) -> Option<&'a str> {
    if mount.is_empty() || mount == "/" {
        return None;
    }
    let rest = input.strip_prefix(mount)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(cwd: &DirPath, input: &str) -> Result<DirPath, PathError> {
        DirPath::resolve(cwd, "/sd", input)
    }

    fn parts(path: &DirPath) -> Vec<&str> {
        path.components().iter().map(|n| n.as_str()).collect()
    }

    #[test]
    fn short_names_are_upper_cased() {
        let name = ShortName::parse("prueba.txt").unwrap();
        assert_eq!(name.as_str(), "PRUEBA.TXT");
        assert_eq!(&name.fat_bytes(), b"PRUEBA  TXT");
    }

    #[test]
    fn short_name_without_extension() {
        let name = ShortName::parse("sd4").unwrap();
        assert_eq!(&name.fat_bytes(), b"SD4        ");
        assert_eq!(ShortName::parse("data.").unwrap().as_str(), "DATA");
    }

    #[test]
    fn rejects_names_that_do_not_fit_8_3() {
        for bad in ["", "verylongname.txt", "a.json", "a.b.c", ".hidden", "sp ace", "a*b", "ñ"] {
            assert_eq!(ShortName::parse(bad), Err(PathError::InvalidName), "{bad}");
        }
    }

    #[test]
    fn mount_prefix_and_plain_absolute_paths_hit_the_root() {
        let mut cwd = DirPath::ROOT;
        cwd.push(ShortName::parse("logs").unwrap()).unwrap();

        assert_eq!(parts(&resolve(&cwd, "/sd/a.txt").unwrap()), ["A.TXT"]);
        assert_eq!(parts(&resolve(&cwd, "/a.txt").unwrap()), ["A.TXT"]);
        assert!(resolve(&cwd, "/sd").unwrap().is_root());
        // "/sdx" is not under the mount point, so it is a plain absolute path
        assert_eq!(parts(&resolve(&cwd, "/sdx/a.txt").unwrap()), ["SDX", "A.TXT"]);
    }

    #[test]
    fn relative_paths_use_the_current_directory() {
        let mut cwd = DirPath::ROOT;
        cwd.push(ShortName::parse("logs").unwrap()).unwrap();

        assert_eq!(parts(&resolve(&cwd, "day1/a.csv").unwrap()), ["LOGS", "DAY1", "A.CSV"]);
        assert_eq!(parts(&resolve(&cwd, "./x/../y").unwrap()), ["LOGS", "Y"]);
        assert!(resolve(&cwd, "..").unwrap().is_root());
        assert_eq!(resolve(&cwd, "../.."), Err(PathError::AboveRoot));
    }

    #[test]
    fn empty_and_too_deep_paths_fail() {
        assert_eq!(resolve(&DirPath::ROOT, ""), Err(PathError::Empty));
        assert_eq!(
            resolve(&DirPath::ROOT, "/a/b/c/d/e/f/g/h/i"),
            Err(PathError::TooDeep)
        );
    }

    #[test]
    fn split_last_and_display() {
        let path = resolve(&DirPath::ROOT, "/sd/a/b.txt").unwrap();
        let (parent, name) = path.split_last().unwrap();
        assert_eq!(name.as_str(), "B.TXT");
        assert_eq!(format!("{parent}"), "/A");
        assert_eq!(format!("{path}"), "/A/B.TXT");
        assert!(DirPath::ROOT.split_last().is_none());
        assert_eq!(path.prefix(1), parent);
    }
}
