//! The transactional file family.
//!
//! Every id names one logical file of a given storage shape. The content
//! types here hold the file state and its pure operations; the
//! `Transactional*` handles bind a file to a transaction, reading through
//! the transaction's staged copy and staging every change copy-on-write.

pub mod intents;
pub mod mjd;
pub mod random_access;
pub mod stream;
pub mod timeseries;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;

pub use intents::WriteIntents;
pub use mjd::{MjdContent, TransactionalMjdFile};
pub use random_access::{FileMetadata, RandomAccessContent, TransactionalRandomAccessFile};
pub use stream::{StreamContent, TransactionalStreamFile};
pub use timeseries::{CadenceIntervals, TransactionalTimeSeriesFile};

/// Storage shape of a file. Each shape has its own index tree, so the same
/// id may exist once per shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// Whole-payload blobs.
    Stream,
    /// Random-access files, including cadence time series.
    RandomAccess,
    /// MJD-indexed time series.
    Mjd,
}

impl Shape {
    /// Every shape, in index order.
    pub const ALL: [Shape; 3] = [Shape::Stream, Shape::RandomAccess, Shape::Mjd];

    /// Name of the shape's index files.
    pub fn tree_name(self) -> &'static str {
        match self {
            Shape::Stream => "stream",
            Shape::RandomAccess => "random",
            Shape::Mjd => "mjd",
        }
    }

    /// Position in [`Shape::ALL`].
    pub fn index(self) -> usize {
        match self {
            Shape::Stream => 0,
            Shape::RandomAccess => 1,
            Shape::Mjd => 2,
        }
    }

    /// Parses a tree name.
    pub fn from_tree_name(name: &str) -> Option<Shape> {
        Shape::ALL.into_iter().find(|s| s.tree_name() == name)
    }
}

/// Committed or staged content of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    /// A blob.
    Stream(StreamContent),
    /// A random-access file.
    RandomAccess(RandomAccessContent),
    /// An MJD series.
    Mjd(MjdContent),
}

impl StoredValue {
    /// Shape of the content.
    pub fn shape(&self) -> Shape {
        match self {
            StoredValue::Stream(_) => Shape::Stream,
            StoredValue::RandomAccess(_) => Shape::RandomAccess,
            StoredValue::Mjd(_) => Shape::Mjd,
        }
    }

    /// Serializes the value into a data record payload.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a data record payload read for `id` from the `shape` index.
    pub fn decode(id: &FsId, shape: Shape, payload: &[u8]) -> StoreResult<Self> {
        let value: StoredValue = bincode::deserialize(payload)
            .map_err(|e| StoreError::corruption(format!("record of {}: {}", id, e)))?;
        if value.shape() != shape {
            return Err(StoreError::ShapeMismatch {
                id: id.clone(),
                expected: shape.tree_name(),
                actual: value.shape().tree_name(),
            });
        }
        Ok(value)
    }
}

/// Outcome of reading an id: not-found is an ordinary result.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult<T> {
    /// The id has a value.
    Found(T),
    /// The id has no committed (or staged) value.
    NotFound,
}

impl<T> ReadResult<T> {
    /// Converts into an `Option`.
    pub fn into_option(self) -> Option<T> {
        match self {
            ReadResult::Found(v) => Some(v),
            ReadResult::NotFound => None,
        }
    }

    /// Returns true for `Found`.
    pub fn is_found(&self) -> bool {
        matches!(self, ReadResult::Found(_))
    }

    /// Maps the found value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadResult<U> {
        match self {
            ReadResult::Found(v) => ReadResult::Found(f(v)),
            ReadResult::NotFound => ReadResult::NotFound,
        }
    }
}

impl<T> From<Option<T>> for ReadResult<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => ReadResult::Found(v),
            None => ReadResult::NotFound,
        }
    }
}
