//! Random-access files: sparse byte content with valid and origin intervals.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::intervals::{OriginSet, SimpleInterval, TaggedInterval, ValidSet};
use crate::series::DataType;
use crate::store::FileStore;
use crate::transaction::Xid;

use super::{ReadResult, Shape, StoredValue};

/// Content of a random-access file. Written bytes are kept as chunks keyed
/// by their first offset; chunks never overlap or touch, and offsets between
/// them take no space. Only offsets in `valid` carry written data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomAccessContent {
    chunks: BTreeMap<u64, Vec<u8>>,
    valid: ValidSet,
    origins: OriginSet,
    data_type: DataType,
}

/// Interval metadata of a random-access file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    /// Offsets holding written data.
    pub valid: Vec<SimpleInterval>,
    /// Producers of each written range.
    pub origins: Vec<TaggedInterval>,
    /// Element type recorded for the file.
    pub data_type: DataType,
}

impl RandomAccessContent {
    /// An empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Element type recorded for the file.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Records the element type.
    pub fn set_data_type(&mut self, data_type: DataType) {
        self.data_type = data_type;
    }

    /// Returns true if no offset holds data.
    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    /// Valid offsets.
    pub fn valid(&self) -> &ValidSet {
        &self.valid
    }

    /// Origin intervals.
    pub fn origins(&self) -> &OriginSet {
        &self.origins
    }

    /// Bytes held by the content, gaps excluded.
    pub fn stored_bytes(&self) -> u64 {
        self.chunks.values().map(|c| c.len() as u64).sum()
    }

    /// Reads `len` bytes at `offset`. Offsets never written read as zero.
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let end = offset + len as u64;
        let first = self.chunk_at_or_before(offset).unwrap_or(offset);
        for (&start, chunk) in self.chunks.range(first..end) {
            let lo = offset.max(start);
            let hi = end.min(start + chunk.len() as u64);
            if lo < hi {
                out[(lo - offset) as usize..(hi - offset) as usize]
                    .copy_from_slice(&chunk[(lo - start) as usize..(hi - start) as usize]);
            }
        }
        out
    }

    /// Writes `bytes` at `offset`, marking the range valid and produced by
    /// `origin`.
    pub fn write(&mut self, offset: u64, bytes: &[u8], origin: u64) {
        if bytes.is_empty() {
            return;
        }
        let end = offset + bytes.len() as u64 - 1;
        self.put_bytes(offset, bytes);
        self.valid.add(SimpleInterval::new(offset, end));
        self.origins.add(TaggedInterval::new(offset, end, origin));
    }

    /// Writes `bytes` at `offset` and records the given intervals, which must
    /// lie inside the written range. Offsets in the range but outside
    /// `valid` are stored but stay invalid.
    pub fn write_with_intervals(
        &mut self,
        offset: u64,
        bytes: &[u8],
        valid: &[SimpleInterval],
        origins: &[TaggedInterval],
    ) -> StoreResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let end = offset + bytes.len() as u64 - 1;
        let outside = valid
            .iter()
            .map(|v| (v.start, v.end))
            .chain(origins.iter().map(|o| (o.start, o.end)))
            .any(|(s, e)| s > e || s < offset || e > end);
        if outside {
            return Err(StoreError::InvalidArgument(format!(
                "intervals outside of written range [{}, {}]",
                offset, end
            )));
        }
        self.put_bytes(offset, bytes);
        for v in valid {
            self.valid.add(*v);
        }
        for o in origins {
            self.origins.add(*o);
        }
        Ok(())
    }

    /// Records `origin` as the producer of its range, superseding earlier
    /// producers there.
    pub fn record_origin(&mut self, origin: TaggedInterval) {
        self.origins.add(origin);
    }

    /// Invalidates `[start, end]`, drops its origins and releases its bytes.
    pub fn delete_interval(&mut self, start: u64, end: u64) {
        if start > end {
            return;
        }
        self.valid.remove(start, end);
        self.origins.remove(start, end);
        self.drop_bytes(start, end);
    }

    /// Interval metadata.
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            valid: self.valid.intervals().to_vec(),
            origins: self.origins.intervals().to_vec(),
            data_type: self.data_type,
        }
    }

    fn chunk_at_or_before(&self, offset: u64) -> Option<u64> {
        self.chunks.range(..=offset).next_back().map(|(&start, _)| start)
    }

    fn put_bytes(&mut self, offset: u64, bytes: &[u8]) {
        let mut start = offset;
        let mut end = offset + bytes.len() as u64;
        // chunks overlapping or touching the write merge with it
        let touching: Vec<u64> = self
            .chunks
            .range(..=end)
            .rev()
            .take_while(|&(&s, c)| s + c.len() as u64 >= offset)
            .map(|(&s, _)| s)
            .collect();
        for &s in &touching {
            start = start.min(s);
            end = end.max(s + self.chunks[&s].len() as u64);
        }
        let mut merged = vec![0u8; (end - start) as usize];
        for s in touching {
            if let Some(chunk) = self.chunks.remove(&s) {
                let at = (s - start) as usize;
                merged[at..at + chunk.len()].copy_from_slice(&chunk);
            }
        }
        let at = (offset - start) as usize;
        merged[at..at + bytes.len()].copy_from_slice(bytes);
        self.chunks.insert(start, merged);
    }

    fn drop_bytes(&mut self, start: u64, end: u64) {
        let stop = end.saturating_add(1);
        let first = self.chunk_at_or_before(start).unwrap_or(start);
        let hit: Vec<u64> = self.chunks.range(first..stop).map(|(&s, _)| s).collect();
        for s in hit {
            let Some(mut chunk) = self.chunks.remove(&s) else {
                continue;
            };
            let chunk_end = s + chunk.len() as u64;
            if chunk_end <= start {
                self.chunks.insert(s, chunk);
                continue;
            }
            if chunk_end > stop {
                let tail = chunk.split_off((stop - s) as usize);
                self.chunks.insert(stop, tail);
            }
            if s < start {
                chunk.truncate((start - s) as usize);
                self.chunks.insert(s, chunk);
            }
        }
    }
}

/// A random-access file bound to a transaction.
pub struct TransactionalRandomAccessFile<'a> {
    store: &'a FileStore,
    xid: Xid,
    id: FsId,
}

impl<'a> TransactionalRandomAccessFile<'a> {
    pub(crate) fn new(store: &'a FileStore, xid: Xid, id: FsId) -> Self {
        Self { store, xid, id }
    }

    /// The file's id.
    pub fn id(&self) -> &FsId {
        &self.id
    }

    fn content(&self) -> StoreResult<Option<RandomAccessContent>> {
        match self
            .store
            .load(Some(&self.xid), Shape::RandomAccess, &self.id)?
        {
            Some(StoredValue::RandomAccess(content)) => Ok(Some(content)),
            Some(other) => Err(StoreError::ShapeMismatch {
                id: self.id.clone(),
                expected: Shape::RandomAccess.tree_name(),
                actual: other.shape().tree_name(),
            }),
            None => Ok(None),
        }
    }

    fn update(&self, f: impl FnOnce(&mut RandomAccessContent) -> StoreResult<()>) -> StoreResult<()> {
        self.store
            .modify(&self.xid, Shape::RandomAccess, &self.id, |current| {
                let mut content = match current {
                    Some(StoredValue::RandomAccess(c)) => c,
                    _ => RandomAccessContent::new(),
                };
                f(&mut content)?;
                Ok(Some(StoredValue::RandomAccess(content)))
            })
    }

    /// Reads `len` bytes at `offset` as seen by the transaction.
    pub fn read(&self, offset: u64, len: usize) -> StoreResult<ReadResult<Vec<u8>>> {
        Ok(self.content()?.map(|c| c.read(offset, len)).into())
    }

    /// Stages a write of `bytes` at `offset` produced by `origin`.
    pub fn write(&self, offset: u64, bytes: &[u8], origin: u64) -> StoreResult<()> {
        self.update(|c| {
            c.write(offset, bytes, origin);
            Ok(())
        })
    }

    /// Stages a write with explicit valid and origin intervals.
    pub fn write_with_intervals(
        &self,
        offset: u64,
        bytes: &[u8],
        valid: &[SimpleInterval],
        origins: &[TaggedInterval],
    ) -> StoreResult<()> {
        self.update(|c| c.write_with_intervals(offset, bytes, valid, origins))
    }

    /// Stages invalidation of `[start, end]`.
    pub fn delete_interval(&self, start: u64, end: u64) -> StoreResult<()> {
        self.update(|c| {
            c.delete_interval(start, end);
            Ok(())
        })
    }

    /// Interval metadata as seen by the transaction.
    pub fn metadata(&self) -> StoreResult<ReadResult<FileMetadata>> {
        Ok(self.content()?.map(|c| c.metadata()).into())
    }

    /// Stages removal of the whole file.
    pub fn delete(&self) -> StoreResult<()> {
        self.store
            .modify(&self.xid, Shape::RandomAccess, &self.id, |_| Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_write_and_read() {
        let mut c = RandomAccessContent::new();
        c.write(100, b"abcd", 1);
        c.write(110, b"xy", 2);
        assert_eq!(c.read(100, 4), b"abcd");
        assert_eq!(c.read(98, 4), b"\0\0ab");
        assert_eq!(c.read(104, 8), b"\0\0\0\0\0\0xy");
        assert_eq!(
            c.metadata().valid,
            vec![SimpleInterval::new(100, 103), SimpleInterval::new(110, 111)]
        );
    }

    #[test]
    fn test_write_before_base_grows_left() {
        let mut c = RandomAccessContent::new();
        c.write(10, b"zz", 1);
        c.write(4, b"aa", 1);
        assert_eq!(c.read(4, 8), b"aa\0\0\0\0zz");
        assert_eq!(c.read(0, 2), b"\0\0");
    }

    #[test]
    fn test_partial_overwrite_replaces_origin() {
        let mut c = RandomAccessContent::new();
        c.write(0, &[1u8; 10], 7);
        c.write(4, &[2u8; 2], 8);
        assert_eq!(c.read(0, 10), vec![1, 1, 1, 1, 2, 2, 1, 1, 1, 1]);
        assert_eq!(
            c.metadata().origins,
            vec![
                TaggedInterval::new(0, 3, 7),
                TaggedInterval::new(4, 5, 8),
                TaggedInterval::new(6, 9, 7),
            ]
        );
        assert_eq!(c.metadata().valid, vec![SimpleInterval::new(0, 9)]);
    }

    #[test]
    fn test_delete_interval_releases_bytes() {
        let mut c = RandomAccessContent::new();
        c.write(0, &[5u8; 100], 1);
        c.delete_interval(0, 89);
        assert_eq!(c.stored_bytes(), 10);
        assert_eq!(c.read(88, 4), vec![0, 0, 5, 5]);
        c.delete_interval(40, 49);
        assert_eq!(c.stored_bytes(), 10);
        c.delete_interval(90, 99);
        assert!(c.is_empty());
        assert_eq!(c.stored_bytes(), 0);
        assert!(c.chunks.is_empty());
    }

    #[test]
    fn test_delete_inside_chunk_splits_it() {
        let mut c = RandomAccessContent::new();
        c.write(10, &[1u8; 20], 1);
        c.delete_interval(15, 19);
        assert_eq!(c.chunks.len(), 2);
        assert_eq!(c.stored_bytes(), 15);
        assert_eq!(c.read(13, 9), vec![1, 1, 0, 0, 0, 0, 0, 1, 1]);
        // refilling the hole joins the pieces again
        c.write(15, &[2u8; 5], 2);
        assert_eq!(c.chunks.len(), 1);
        assert_eq!(c.read(14, 7), vec![1, 2, 2, 2, 2, 2, 1]);
    }

    #[test]
    fn test_far_apart_writes_stay_sparse() {
        let mut c = RandomAccessContent::new();
        c.write(0, b"a", 1);
        c.write(1 << 40, b"b", 1);
        assert_eq!(c.stored_bytes(), 2);
        assert_eq!(c.read((1 << 40) - 1, 2), b"\0b");
        let encoded = StoredValue::RandomAccess(c).encode().unwrap();
        assert!(encoded.len() < 256, "record is {} bytes", encoded.len());
    }

    #[test]
    fn test_write_spanning_chunks_merges() {
        let mut c = RandomAccessContent::new();
        c.write(0, b"aa", 1);
        c.write(4, b"bb", 1);
        c.write(8, b"cc", 1);
        assert_eq!(c.chunks.len(), 3);
        c.write(1, b"xxxxxxxx", 2);
        assert_eq!(c.chunks.len(), 1);
        assert_eq!(c.read(0, 10), b"axxxxxxxxc");
    }

    #[test]
    fn test_write_with_intervals_checks_bounds() {
        let mut c = RandomAccessContent::new();
        let err = c.write_with_intervals(10, b"abc", &[SimpleInterval::new(10, 13)], &[]);
        assert!(err.is_err());
        c.write_with_intervals(
            10,
            b"abc",
            &[SimpleInterval::new(10, 10), SimpleInterval::new(12, 12)],
            &[TaggedInterval::new(10, 12, 3)],
        )
        .unwrap();
        assert!(c.valid().contains(12));
        assert!(!c.valid().contains(11));
    }
}
