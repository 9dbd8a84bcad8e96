//! Shared value types: key ranges, exported files and checksum summaries.

use std::cmp::Ordering;
use std::fmt;

/// Half-open key interval `[start, end)`.
///
/// An empty `end` means the interval runs to the end of the key space.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Build a range from anything convertible into owned key bytes.
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// True when the range has no upper bound.
    pub fn is_unbounded(&self) -> bool {
        self.end.is_empty()
    }

    /// True when the range contains no keys at all.
    pub fn is_empty(&self) -> bool {
        !self.end.is_empty() && self.start >= self.end
    }

    /// True when `key` falls inside `[start, end)`.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key_before_end(key, &self.end)
    }

    /// True when `[start, end)` lies entirely inside this range.
    pub fn contains_range(&self, start: &[u8], end: &[u8]) -> bool {
        start >= self.start.as_slice() && cmp_end(end, &self.end) != Ordering::Greater
    }

    /// True when `[start, end)` shares at least one key with this range.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        key_before_end(start, &self.end) && key_before_end(&self.start, end)
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end.is_empty() {
            write!(f, "[{}, +inf)", self.start.escape_ascii())
        } else {
            write!(
                f,
                "[{}, {})",
                self.start.escape_ascii(),
                self.end.escape_ascii()
            )
        }
    }
}

/// Compare two end keys, treating an empty key as unbounded.
pub fn cmp_end(a: &[u8], b: &[u8]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// `key < end` where an empty `end` is unbounded.
pub fn key_before_end(key: &[u8], end: &[u8]) -> bool {
    end.is_empty() || key < end
}

/// One exported data file as reported by a storage node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupFile {
    pub name: String,
    /// Column family the file was cut from.
    pub cf: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub crc64_xor: u64,
    pub total_kvs: u64,
    pub total_bytes: u64,
    /// Size of the file on the destination, in bytes.
    pub size: u64,
}

/// Accumulated checksum for a physical table (or partition).
///
/// Folding is commutative: `crc64_xor` is combined with XOR and the counters
/// are summed, so the order in which ranges complete does not matter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChecksumStats {
    pub crc64_xor: u64,
    pub total_kvs: u64,
    pub total_bytes: u64,
}

impl ChecksumStats {
    /// Summarise a set of files.
    pub fn from_files(files: &[BackupFile]) -> Self {
        let mut stats = Self::default();
        for file in files {
            stats.merge(Self {
                crc64_xor: file.crc64_xor,
                total_kvs: file.total_kvs,
                total_bytes: file.total_bytes,
            });
        }
        stats
    }

    /// Fold another summary into this one.
    pub fn merge(&mut self, other: ChecksumStats) {
        self.crc64_xor ^= other.crc64_xor;
        self.total_kvs = self.total_kvs.saturating_add(other.total_kvs);
        self.total_bytes = self.total_bytes.saturating_add(other.total_bytes);
    }
}
