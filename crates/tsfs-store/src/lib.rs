#![warn(missing_docs)]

//! tsfs storage engine: transactional, B-tree indexed file store for
//! pipeline time series and blobs
//!
//! Every stored item is named by an [`FsId`]. Its committed content lives in
//! append-only data files and is located through one disk-resident B-tree
//! per storage shape. Writes are staged inside a transaction and become
//! durable and visible atomically on commit, with a commit journal covering
//! crashes between the data and index updates.

pub mod bitset;
pub mod btree;
pub mod cache;
pub mod client;
pub mod config;
pub mod data_file;
pub mod error;
pub mod frame;
pub mod fsid;
pub mod intervals;
pub mod journal;
pub mod location;
pub mod monitor;
pub mod series;
pub mod store;
pub mod transaction;
pub mod xfiles;

pub use bitset::PersistentBitSet;
pub use btree::{BTree, CheckReport, DiskNodeIo, PageOp};
pub use cache::{CacheRegistry, CacheStats, NodeCache};
pub use client::{FileStoreClient, SeriesSample};
pub use config::{ConflictPolicy, StoreConfig};
pub use data_file::DataFiles;
pub use error::{ErrorClass, StoreError, StoreResult};
pub use fsid::{FsId, MAX_FSID_LEN};
pub use intervals::{IntervalSet, OriginSet, SimpleInterval, Span, TaggedInterval, ValidSet};
pub use journal::{CommitJournal, JournalRecord, JournalStats};
pub use location::{resolve_all, FsIdLocation, FsIdOrder, Location, LocationIndex, ReadScheduler};
pub use monitor::{CachePerformanceRow, MetricValue, StoreMonitor, TransactionRow};
pub use series::{
    BlobResult, DataType, FloatTimeSeries, IntTimeSeries, MjdPoint, MjdTimeSeries, Sample,
    TimeSeries,
};
pub use store::{FileStore, StoreBackend, StoreStats};
pub use transaction::{
    TransactionContext, TransactionInfo, TransactionManager, TransactionService,
    TransactionState, Xid,
};
pub use xfiles::{
    CadenceIntervals, FileMetadata, MjdContent, RandomAccessContent, ReadResult, Shape, StoredValue,
    StreamContent, TransactionalMjdFile, TransactionalRandomAccessFile, TransactionalStreamFile,
    TransactionalTimeSeriesFile, WriteIntents,
};
