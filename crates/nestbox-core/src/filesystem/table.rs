//! Reader for the kernel's `/proc/mounts` table.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use nestbox_common::error::{NestboxError, Result};

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted source (device, pseudo-filesystem name, or path).
    pub source: String,
    /// Mount point.
    pub target: PathBuf,
    /// Filesystem type.
    pub fs_type: String,
}

/// Snapshot of the mount table in kernel order (oldest mount first).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Parses the `/proc/mounts` format. Malformed lines are ignored.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = fields.next()?;
                let target = fields.next()?;
                let fs_type = fields.next()?;
                Some(MountEntry {
                    source: String::from_utf8_lossy(&unescape(source)).into_owned(),
                    target: PathBuf::from(OsString::from_vec(unescape(target))),
                    fs_type: String::from_utf8_lossy(&unescape(fs_type)).into_owned(),
                })
            })
            .collect();
        Self { entries }
    }

    /// Reads and parses a mount table file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| NestboxError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::parse(&content))
    }

    /// All entries, in table order.
    #[must_use]
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Whether `path` is a mount point.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.target == path)
    }

    /// Mount points at or below `prefix`, most recent first.
    ///
    /// Reversing table order puts nested mounts before the mounts they sit
    /// on, so unmounting in this order never hits a busy parent.
    #[must_use]
    pub fn reverse_subtree(&self, prefix: &Path) -> Vec<PathBuf> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.target.starts_with(prefix))
            .map(|e| e.target.clone())
            .collect()
    }
}

/// Decodes the `\ooo` octal escapes the kernel uses for whitespace and
/// backslashes.
fn unescape(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_triplet(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(u8::try_from(value).unwrap_or(b'?'));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

fn is_octal_triplet(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|b| (b'0'..=b'7').contains(b))
}
