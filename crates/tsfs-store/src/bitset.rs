//! Disk-backed bit vector for existence and allocation tracking.
//!
//! The backing file holds the raw bytes of the bit vector with no header:
//! bit `i` is bit `i % 8` of byte `i / 8`. Every mutation is written through
//! to the file immediately; `sync` or `close` makes it durable. Reopening a
//! closed file reproduces byte-identical state.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StoreResult;

/// A growable bit vector persisted in a single file.
pub struct PersistentBitSet {
    file: File,
    path: PathBuf,
    bytes: Vec<u8>,
}

impl PersistentBitSet {
    /// Opens the bitset at `path`, creating an empty one if it does not exist.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "opened persistent bitset");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            bytes,
        })
    }

    /// Returns the bit at `index`. Indices beyond capacity read as false.
    pub fn get(&self, index: u64) -> bool {
        let byte = (index / 8) as usize;
        match self.bytes.get(byte) {
            Some(b) => b & (1 << (index % 8)) != 0,
            None => false,
        }
    }

    /// Sets the bit at `index`, growing the file if needed.
    pub fn set(&mut self, index: u64, value: bool) -> StoreResult<()> {
        let byte = (index / 8) as usize;
        if byte >= self.bytes.len() {
            if !value {
                return Ok(());
            }
            let old_len = self.bytes.len();
            self.bytes.resize(byte + 1, 0);
            self.apply(index, value);
            self.file.write_all_at(&self.bytes[old_len..], old_len as u64)?;
            return Ok(());
        }
        self.apply(index, value);
        self.file
            .write_all_at(&self.bytes[byte..byte + 1], byte as u64)?;
        Ok(())
    }

    /// Sets every index in `indices` to `value` with a single write.
    pub fn update(&mut self, indices: &[u64], value: bool) -> StoreResult<()> {
        let mut dirty: Option<(usize, usize)> = None;
        let old_len = self.bytes.len();
        for &index in indices {
            let byte = (index / 8) as usize;
            if byte >= self.bytes.len() {
                if !value {
                    continue;
                }
                self.bytes.resize(byte + 1, 0);
            }
            self.apply(index, value);
            dirty = Some(match dirty {
                None => (byte, byte),
                Some((lo, hi)) => (lo.min(byte), hi.max(byte)),
            });
        }
        if let Some((mut lo, mut hi)) = dirty {
            if self.bytes.len() > old_len {
                // zero fill of the grown region must reach the file too
                lo = lo.min(old_len);
                hi = self.bytes.len() - 1;
            }
            self.file.write_all_at(&self.bytes[lo..=hi], lo as u64)?;
        }
        Ok(())
    }

    /// Drops every bit at index `n` and above, shrinking the file.
    pub fn truncate(&mut self, n: u64) -> StoreResult<()> {
        let keep_bytes = n.div_ceil(8) as usize;
        if keep_bytes < self.bytes.len() {
            self.bytes.truncate(keep_bytes);
            self.file.set_len(keep_bytes as u64)?;
        }
        let partial = (n % 8) as u32;
        if partial != 0 && keep_bytes > 0 && keep_bytes <= self.bytes.len() {
            let last = keep_bytes - 1;
            let mask = (1u8 << partial) - 1;
            if self.bytes[last] & !mask != 0 {
                self.bytes[last] &= mask;
                self.file
                    .write_all_at(&self.bytes[last..last + 1], last as u64)?;
            }
        }
        debug!(path = %self.path.display(), n, bytes = self.bytes.len(), "truncated bitset");
        Ok(())
    }

    /// Shrinks storage to the byte holding the last set bit. No-op when the
    /// tail is already minimal.
    pub fn truncate_end_if_empty(&mut self) -> StoreResult<()> {
        let minimal = self
            .bytes
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |p| p + 1);
        if minimal < self.bytes.len() {
            self.bytes.truncate(minimal);
            self.file.set_len(minimal as u64)?;
            debug!(path = %self.path.display(), bytes = minimal, "trimmed empty bitset tail");
        }
        Ok(())
    }

    /// Returns the first index at or after `from` whose bit is false.
    /// Everything beyond capacity is implicitly false.
    pub fn find_next_false(&self, from: u64) -> u64 {
        let mut index = from;
        loop {
            let byte = (index / 8) as usize;
            match self.bytes.get(byte) {
                None => return index,
                Some(0xFF) => index = (byte as u64 + 1) * 8,
                Some(b) => {
                    let bit = index % 8;
                    if b & (1 << bit) == 0 {
                        return index;
                    }
                    index += 1;
                }
            }
        }
    }

    /// Returns every index whose bit equals `value`, ascending. For `false`
    /// the scan covers `[0, len())`.
    pub fn all_index(&self, value: bool) -> Vec<u64> {
        let limit = if value {
            self.bytes.len() as u64 * 8
        } else {
            self.len()
        };
        (0..limit).filter(|&i| self.get(i) == value).collect()
    }

    /// Index of the highest set bit plus one, or 0 if no bit is set.
    pub fn len(&self) -> u64 {
        match self.bytes.iter().rposition(|b| *b != 0) {
            None => 0,
            Some(p) => p as u64 * 8 + (8 - self.bytes[p].leading_zeros() as u64),
        }
    }

    /// Returns true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of set bits.
    pub fn cardinality(&self) -> u64 {
        self.bytes.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Size of the backing storage in bytes.
    pub fn capacity_in_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes the backing file to disk.
    pub fn sync(&self) -> StoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Makes all mutations durable and releases the file.
    pub fn close(self) -> StoreResult<()> {
        self.sync()
    }

    fn apply(&mut self, index: u64, value: bool) {
        let byte = (index / 8) as usize;
        let bit = 1u8 << (index % 8);
        if value {
            self.bytes[byte] |= bit;
        } else {
            self.bytes[byte] &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_in(dir: &TempDir) -> PersistentBitSet {
        PersistentBitSet::open(&dir.path().join("test.bits")).unwrap()
    }

    #[test]
    fn test_empty_bitset() {
        let dir = TempDir::new().unwrap();
        let bits = open_in(&dir);
        assert!(!bits.get(0));
        assert!(!bits.get(1_000_000));
        assert_eq!(bits.len(), 0);
        assert_eq!(bits.capacity_in_bytes(), 0);
        assert!(bits.all_index(true).is_empty());
        assert!(bits.all_index(false).is_empty());
    }

    #[test]
    fn test_set_and_get() {
        let dir = TempDir::new().unwrap();
        let mut bits = open_in(&dir);
        bits.set(3, true).unwrap();
        bits.set(17, true).unwrap();
        assert!(bits.get(3));
        assert!(bits.get(17));
        assert!(!bits.get(4));
        assert_eq!(bits.capacity_in_bytes(), 3);
        assert_eq!(bits.len(), 18);

        bits.set(3, false).unwrap();
        assert!(!bits.get(3));
        assert_eq!(bits.cardinality(), 1);
    }

    #[test]
    fn test_clear_beyond_capacity_does_not_grow() {
        let dir = TempDir::new().unwrap();
        let mut bits = open_in(&dir);
        bits.set(1000, false).unwrap();
        assert_eq!(bits.capacity_in_bytes(), 0);
    }

    #[test]
    fn test_sparse_scenario_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.bits");
        {
            let mut bits = PersistentBitSet::open(&path).unwrap();
            bits.set(1, true).unwrap();
            bits.set(90000, true).unwrap();
            assert_eq!(bits.all_index(true), vec![1, 90000]);
            assert_eq!(bits.all_index(false).len(), 90000 - 2 + 1);
            bits.close().unwrap();
        }
        let bits = PersistentBitSet::open(&path).unwrap();
        assert_eq!(bits.all_index(true), vec![1, 90000]);
        let falses = bits.all_index(false);
        assert_eq!(falses.len(), 90000 - 2 + 1);
        assert_eq!(falses[0], 0);
        assert_eq!(falses[1], 2);
        assert_eq!(*falses.last().unwrap(), 89999);
    }

    #[test]
    fn test_update_batch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.bits");
        let mut bits = PersistentBitSet::open(&path).unwrap();
        bits.update(&[5, 64, 2], true).unwrap();
        assert_eq!(bits.all_index(true), vec![2, 5, 64]);
        bits.update(&[5, 500], false).unwrap();
        assert_eq!(bits.all_index(true), vec![2, 64]);
        bits.close().unwrap();

        let reopened = PersistentBitSet::open(&path).unwrap();
        assert_eq!(reopened.all_index(true), vec![2, 64]);
        assert_eq!(reopened.capacity_in_bytes(), 9);
    }

    #[test]
    fn test_truncate_clears_partial_byte() {
        let dir = TempDir::new().unwrap();
        let mut bits = open_in(&dir);
        for i in 0..20 {
            bits.set(i, true).unwrap();
        }
        bits.truncate(11).unwrap();
        assert_eq!(bits.capacity_in_bytes(), 2);
        assert_eq!(bits.len(), 11);
        assert!(bits.get(10));
        assert!(!bits.get(11));

        bits.set(30, true).unwrap();
        assert!(!bits.get(12));
        assert!(!bits.get(19));
        assert_eq!(bits.all_index(true).len(), 12);
    }

    #[test]
    fn test_truncate_end_if_empty() {
        let dir = TempDir::new().unwrap();
        let mut bits = open_in(&dir);
        bits.set(100, true).unwrap();
        bits.set(7, true).unwrap();
        bits.set(100, false).unwrap();
        assert_eq!(bits.capacity_in_bytes(), 13);
        bits.truncate_end_if_empty().unwrap();
        assert_eq!(bits.capacity_in_bytes(), 1);
        bits.truncate_end_if_empty().unwrap();
        assert_eq!(bits.capacity_in_bytes(), 1);
        assert!(bits.get(7));
    }

    #[test]
    fn test_find_next_false() {
        let dir = TempDir::new().unwrap();
        let mut bits = open_in(&dir);
        for i in 0..24 {
            bits.set(i, true).unwrap();
        }
        bits.set(5, false).unwrap();
        assert_eq!(bits.find_next_false(0), 5);
        assert_eq!(bits.find_next_false(6), 24);
        assert_eq!(bits.find_next_false(1000), 1000);
    }

    #[test]
    fn test_file_matches_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.bits");
        let mut bits = PersistentBitSet::open(&path).unwrap();
        bits.set(9, true).unwrap();
        bits.set(33, true).unwrap();
        bits.truncate(20).unwrap();
        bits.close().unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, vec![0u8, 0b0000_0010, 0]);
    }
}
