//! The transactional file store.
//!
//! Writes are staged per transaction and reach disk only in commit, which
//! runs under the journal mutex:
//!
//! 1. staged values are appended to the data files and fsynced,
//! 2. index inserts and deletes become pending page ops of the trees,
//! 3. one journal record holding every pending op is written and fsynced,
//! 4. the pages are flushed to the index files,
//! 5. the journal is cleared.
//!
//! A failure before the journal record is durable discards the pending ops
//! and leaves the committed state untouched. A failure after it poisons the
//! store; reopening replays the journal.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::{fs, io, mem};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::btree::{BTree, CheckReport, DiskNodeIo};
use crate::cache::{CacheRegistry, NodeCache};
use crate::config::StoreConfig;
use crate::data_file::DataFiles;
use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::journal::{CommitJournal, JournalRecord, JournalStats};
use crate::location::{resolve_all, FsIdOrder, ReadScheduler};
use crate::monitor::StoreMonitor;
use crate::series::{BlobResult, FloatTimeSeries, IntTimeSeries, MjdTimeSeries, Sample, TimeSeries};
use crate::transaction::{
    Staged, TransactionContext, TransactionEntry, TransactionManager, TransactionService,
    TransactionState, Xid,
};
use crate::xfiles::{
    timeseries, CadenceIntervals, MjdContent, RandomAccessContent, ReadResult, Shape,
    StoredValue, TransactionalMjdFile,
    TransactionalRandomAccessFile, TransactionalStreamFile, TransactionalTimeSeriesFile,
    WriteIntents,
};

/// Operations offered to clients, on top of the transaction lifecycle.
///
/// Writes take the transaction they stage into. Reads take an optional
/// transaction: with one they see its staged writes over the committed
/// state, without one they see the committed state only.
pub trait StoreBackend: TransactionService {
    /// Stages `bytes` as the whole content of blob `id`.
    fn write_blob(&self, xid: &Xid, id: &FsId, origin: u64, bytes: &[u8]) -> StoreResult<()>;
    /// Reads blob `id`.
    fn read_blob(&self, xid: Option<&Xid>, id: &FsId) -> StoreResult<ReadResult<BlobResult>>;
    /// Returns true if blob `id` exists.
    fn blob_exists(&self, xid: Option<&Xid>, id: &FsId) -> StoreResult<bool>;
    /// Stages removal of blob `id`.
    fn delete_blob(&self, xid: &Xid, id: &FsId) -> StoreResult<()>;

    /// Stages writes of float series.
    fn write_time_series_float(
        &self,
        xid: &Xid,
        series: &[FloatTimeSeries],
        overwrite: bool,
    ) -> StoreResult<()>;
    /// Stages writes of int series.
    fn write_time_series_int(
        &self,
        xid: &Xid,
        series: &[IntTimeSeries],
        overwrite: bool,
    ) -> StoreResult<()>;
    /// Reads cadences `[start, end]` of float series, one result per id in
    /// request order.
    fn read_time_series_float(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<ReadResult<FloatTimeSeries>>>;
    /// Reads cadences `[start, end]` of int series, one result per id in
    /// request order.
    fn read_time_series_int(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<ReadResult<IntTimeSeries>>>;
    /// Stages removal of cadence series.
    fn delete_time_series(&self, xid: &Xid, ids: &[FsId]) -> StoreResult<()>;
    /// Valid and origin cadence intervals of each series, one result per
    /// id in request order.
    fn cadence_intervals_for_ids(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
    ) -> StoreResult<Vec<ReadResult<CadenceIntervals>>>;

    /// Stages writes of MJD series.
    fn write_mjd_time_series(
        &self,
        xid: &Xid,
        series: &[MjdTimeSeries],
        overwrite: bool,
    ) -> StoreResult<()>;
    /// Reads samples in `[start, end]` of MJD series, one result per id in
    /// request order.
    fn read_mjd_time_series(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: f64,
        end: f64,
    ) -> StoreResult<Vec<ReadResult<MjdTimeSeries>>>;
    /// Stages removal of MJD series.
    fn delete_mjd_time_series(&self, xid: &Xid, ids: &[FsId]) -> StoreResult<()>;

    /// Committed ids of `shape` under `prefix`, in id order.
    fn list_ids(&self, shape: Shape, prefix: &str) -> StoreResult<Vec<FsId>>;
}

/// Store-wide counters and sizes.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Committed ids per shape.
    pub ids: Vec<(Shape, u64)>,
    /// Bytes across all data files.
    pub data_bytes: u64,
    /// Data file currently appended to.
    pub active_data_file: u32,
    /// Journal counters.
    pub journal: JournalStats,
    /// Transactions committed since open.
    pub commits: u64,
    /// Transactions rolled back since open.
    pub aborts: u64,
    /// Commits that failed with an error.
    pub failed_commits: u64,
    /// Transactions known to the manager, expired ones included.
    pub open_transactions: usize,
    /// Whether a failed flush poisoned the store.
    pub poisoned: bool,
}

/// A transactional store of blobs, random-access files and time series.
pub struct FileStore {
    config: StoreConfig,
    trees: Vec<RwLock<BTree>>,
    data: DataFiles,
    journal: Mutex<CommitJournal>,
    txns: Arc<TransactionManager>,
    intents: WriteIntents,
    registry: Arc<CacheRegistry>,
    commit_seq: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    failed_commits: AtomicU64,
    poisoned: AtomicBool,
    #[cfg(test)]
    crash_after_journal: AtomicBool,
}

impl FileStore {
    /// Opens or creates the store under `config.root_dir`, replaying an
    /// interrupted commit if the journal holds a complete record.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let root = config.root_dir.clone();
        let index_dir = root.join("index");
        let journal_dir = root.join("journal");
        fs::create_dir_all(&index_dir)?;
        fs::create_dir_all(&journal_dir)?;

        let registry = Arc::new(CacheRegistry::new());
        let mut trees = Vec::with_capacity(Shape::ALL.len());
        for shape in Shape::ALL {
            let cache = Arc::new(NodeCache::new(shape.tree_name(), config.node_cache_entries));
            registry.register(&cache);
            let io = DiskNodeIo::open(
                &index_dir.join(format!("{}.idx", shape.tree_name())),
                &index_dir.join(format!("{}.bits", shape.tree_name())),
                config.page_size,
                config.btree_min_degree,
                cache,
            )?;
            trees.push(BTree::new(io));
        }

        let data = DataFiles::open(&root.join("data"), config.max_data_file_bytes)?;
        let mut journal = CommitJournal::open(&journal_dir.join("commit.jrn"))?;
        let mut sequence = 0;
        if let Some(record) = journal.recover()? {
            Self::replay(&mut trees, &record)?;
            journal.clear(true)?;
            sequence = record.sequence;
            info!(
                sequence = record.sequence,
                xid = %record.xid,
                "replayed interrupted commit"
            );
        }

        let txns = Arc::new(TransactionManager::new(
            config.transaction_timeout(),
            config.expired_retention(),
        ));
        info!(root = %root.display(), "opened file store");
        Ok(Self {
            config,
            trees: trees.into_iter().map(RwLock::new).collect(),
            data,
            journal: Mutex::new(journal),
            txns,
            intents: WriteIntents::new(),
            registry,
            commit_seq: AtomicU64::new(sequence),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            failed_commits: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            crash_after_journal: AtomicBool::new(false),
        })
    }

    fn replay(trees: &mut [BTree], record: &JournalRecord) -> StoreResult<()> {
        for (shape, ops) in &record.trees {
            let tree = &mut trees[shape.index()];
            debug!(tree = shape.tree_name(), ops = ops.len(), "replaying page ops");
            tree.io_mut().stage(ops.clone());
            tree.io_mut().flush(true)?;
        }
        Ok(())
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.config.root_dir
    }

    /// The transaction registry.
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    /// Read-only monitoring view of caches and transactions.
    pub fn monitor(&self) -> StoreMonitor {
        StoreMonitor::new(Arc::clone(&self.registry), Arc::clone(&self.txns))
    }

    /// Returns true once a failed flush has poisoned the store.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn check_poisoned(&self) -> StoreResult<()> {
        if self.is_poisoned() {
            return Err(StoreError::StorePoisoned);
        }
        Ok(())
    }

    fn tree(&self, shape: Shape) -> &RwLock<BTree> {
        &self.trees[shape.index()]
    }

    fn ensure_active(&self, xid: &Xid) -> StoreResult<()> {
        self.txns.with_active(xid, "open file", |_| Ok(()))
    }

    /// Binds random-access file `id` to `xid`.
    pub fn random_access_file(&self, xid: &Xid, id: FsId) -> StoreResult<TransactionalRandomAccessFile<'_>> {
        self.ensure_active(xid)?;
        Ok(TransactionalRandomAccessFile::new(self, xid.clone(), id))
    }

    /// Binds stream file `id` to `xid`.
    pub fn stream_file(&self, xid: &Xid, id: FsId) -> StoreResult<TransactionalStreamFile<'_>> {
        self.ensure_active(xid)?;
        Ok(TransactionalStreamFile::new(self, xid.clone(), id))
    }

    /// Binds cadence series `id` to `xid`.
    pub fn time_series_file(&self, xid: &Xid, id: FsId) -> StoreResult<TransactionalTimeSeriesFile<'_>> {
        self.ensure_active(xid)?;
        Ok(TransactionalTimeSeriesFile::new(self, xid.clone(), id))
    }

    /// Binds MJD series `id` to `xid`.
    pub fn mjd_file(&self, xid: &Xid, id: FsId) -> StoreResult<TransactionalMjdFile<'_>> {
        self.ensure_active(xid)?;
        Ok(TransactionalMjdFile::new(self, xid.clone(), id))
    }

    /// Reads the committed value of `id`.
    fn read_committed(&self, shape: Shape, id: &FsId) -> StoreResult<Option<StoredValue>> {
        self.check_poisoned()?;
        let location = self.tree(shape).read().find(id)?;
        match location {
            Some(location) => {
                let payload = self.data.read(location)?;
                Ok(Some(StoredValue::decode(id, shape, &payload)?))
            }
            None => Ok(None),
        }
    }

    /// Reads the committed values of `ids`, in request order. Index lookups
    /// run in key order and data reads in physical order.
    fn read_committed_batch(&self, shape: Shape, ids: &[FsId]) -> StoreResult<Vec<Option<StoredValue>>> {
        self.check_poisoned()?;
        let orders = FsIdOrder::from_ids(ids);
        let locations = {
            let tree = self.tree(shape).read();
            resolve_all(&*tree, &orders)?
        };
        let mut values = ReadScheduler::execute(&locations, |entry, location| {
            let payload = self.data.read(location)?;
            StoredValue::decode(&entry.id, shape, &payload)
        })?;
        values.resize_with(ids.len(), || None);
        Ok(values)
    }

    /// Value of `id` as seen by `xid`, or the committed value without one.
    pub(crate) fn load(&self, xid: Option<&Xid>, shape: Shape, id: &FsId) -> StoreResult<Option<StoredValue>> {
        if let Some(xid) = xid {
            let staged = self.txns.with_active(xid, "read", |entry| {
                Ok(entry.staged.get(&(shape, id.clone())).cloned())
            })?;
            match staged {
                Some(Staged::Put(value)) => return Ok(Some(value)),
                Some(Staged::Delete) => return Ok(None),
                None => {}
            }
        }
        self.read_committed(shape, id)
    }

    /// Batch form of [`load`](Self::load). Ids staged in `xid` are served
    /// from the transaction; the rest go through the read scheduler.
    pub(crate) fn load_batch(
        &self,
        xid: Option<&Xid>,
        shape: Shape,
        ids: &[FsId],
    ) -> StoreResult<Vec<Option<StoredValue>>> {
        let overlay: Vec<Option<Staged>> = match xid {
            Some(xid) => self.txns.with_active(xid, "read", |entry| {
                Ok(ids
                    .iter()
                    .map(|id| entry.staged.get(&(shape, id.clone())).cloned())
                    .collect())
            })?,
            None => vec![None; ids.len()],
        };

        let unstaged: Vec<usize> = (0..ids.len()).filter(|&i| overlay[i].is_none()).collect();
        let wanted: Vec<FsId> = unstaged.iter().map(|&i| ids[i].clone()).collect();
        let committed = self.read_committed_batch(shape, &wanted)?;

        let mut values: Vec<Option<StoredValue>> = overlay
            .into_iter()
            .map(|staged| match staged {
                Some(Staged::Put(value)) => Some(value),
                _ => None,
            })
            .collect();
        for (i, value) in unstaged.into_iter().zip(committed) {
            values[i] = value;
        }
        Ok(values)
    }

    /// Stages the result of `f` for `id` in `xid`. `f` sees the value as
    /// seen by the transaction and returns the new value, `None` deleting
    /// the id. Takes the write intent on `id` first.
    pub(crate) fn modify<F>(&self, xid: &Xid, shape: Shape, id: &FsId, f: F) -> StoreResult<()>
    where
        F: FnOnce(Option<StoredValue>) -> StoreResult<Option<StoredValue>>,
    {
        self.check_poisoned()?;
        self.txns.with_active(xid, "write", |_| Ok(()))?;
        self.intents
            .acquire(shape, id, xid, self.config.conflict_policy)?;

        // the transaction may have ended while waiting for the intent
        let entry = match self.txns.entry(xid) {
            Ok(entry) => entry,
            Err(e) => {
                self.intents.release(shape, id, xid);
                return Err(e);
            }
        };
        let mut guard = entry.lock();
        if let Err(e) = self
            .txns
            .validate(&mut guard, "write", &[TransactionState::Active])
        {
            drop(guard);
            self.intents.release(shape, id, xid);
            return Err(e);
        }

        let key = (shape, id.clone());
        let current = match guard.staged.get(&key) {
            Some(Staged::Put(value)) => Some(value.clone()),
            Some(Staged::Delete) => None,
            None => self.read_committed(shape, id)?,
        };
        let staged = match f(current)? {
            Some(value) => Staged::Put(value),
            None => Staged::Delete,
        };
        debug!(xid = %xid, id = %id, tree = shape.tree_name(), "staged write");
        guard.staged.insert(key, staged);
        Ok(())
    }

    /// Committed ids of `shape` under `prefix`, in id order.
    pub fn list_ids(&self, shape: Shape, prefix: &str) -> StoreResult<Vec<FsId>> {
        self.check_poisoned()?;
        let prefix = prefix.trim_end_matches('/');
        // '!' is the smallest character an id may contain
        let start = FsId::parse(&format!("{}/!", prefix)).ok();
        let mut ids = Vec::new();
        self.tree(shape).read().scan_from(start.as_ref(), |id, _| {
            if id.is_under(prefix) {
                ids.push(id.clone());
                return true;
            }
            // ids under the prefix are contiguous among paths that start with it
            id.path().starts_with(prefix) || id.path() < prefix
        })?;
        Ok(ids)
    }

    /// Verifies the structure of every index tree.
    pub fn check_trees(&self) -> StoreResult<Vec<(Shape, CheckReport)>> {
        Shape::ALL
            .into_iter()
            .map(|shape| Ok((shape, self.tree(shape).read().check()?)))
            .collect()
    }

    /// Store-wide counters. Walks every index tree.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let mut ids = Vec::with_capacity(Shape::ALL.len());
        for shape in Shape::ALL {
            ids.push((shape, self.tree(shape).read().len()?));
        }
        Ok(StoreStats {
            ids,
            data_bytes: self.data.total_bytes()?,
            active_data_file: self.data.active_file_id(),
            journal: self.journal.lock().stats().clone(),
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
            open_transactions: self.txns.len(),
            poisoned: self.is_poisoned(),
        })
    }

    /// Force-aborts transactions idle past the timeout and releases their
    /// write intents. Returns the newly expired transactions.
    pub fn reap_expired(&self) -> Vec<Xid> {
        let expired = self.txns.reap_expired();
        for xid in &expired {
            self.intents.release_all(xid);
            self.aborts.fetch_add(1, Ordering::Relaxed);
        }
        expired
    }

    /// Removes every committed id of every shape and all data files.
    ///
    /// Refused with [`StoreError::StoreBusy`] while any transaction is live.
    /// Committed readers should be detached: a read that resolved its
    /// locations before the wipe may fail to find its record.
    pub fn clean(&self) -> StoreResult<()> {
        let mut journal = self.journal.lock();
        self.check_poisoned()?;
        let live = self.txns.snapshot().iter().filter(|t| !t.expired).count();
        if live > 0 {
            return Err(StoreError::StoreBusy {
                open_transactions: live,
            });
        }
        let mut trees: Vec<RwLockWriteGuard<'_, BTree>> =
            self.trees.iter().map(|t| t.write()).collect();
        // indexes go before data so a crash never leaves ids pointing at
        // removed records
        let wiped = journal
            .clear(true)
            .map_err(StoreError::from)
            .and_then(|_| {
                for tree in trees.iter_mut() {
                    tree.io_mut().reset(true)?;
                }
                self.data.reset()
            });
        drop(trees);
        if let Err(e) = wiped {
            self.poisoned.store(true, Ordering::SeqCst);
            error!(error = %e, "clean failed part way, store poisoned");
            return Err(e);
        }
        warn!(root = %self.root().display(), "store cleaned, all committed data removed");
        Ok(())
    }

    /// Starts a background task that calls [`reap_expired`](Self::reap_expired)
    /// every `reaper_interval`. The task ends once the store is dropped.
    pub fn spawn_reaper(store: &Arc<FileStore>) -> JoinHandle<()> {
        let weak: Weak<FileStore> = Arc::downgrade(store);
        let period = store.config.reaper_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.reap_expired();
            }
            debug!("reaper stopped");
        })
    }

    fn commit_entry(&self, entry: &mut TransactionEntry) -> StoreResult<()> {
        let xid = entry.xid().clone();
        let staged = mem::take(&mut entry.staged);
        if staged.is_empty() {
            return Ok(());
        }

        let mut puts = Vec::new();
        let mut payloads = Vec::new();
        let mut deletes = Vec::new();
        for ((shape, id), change) in staged {
            match change {
                Staged::Put(value) => {
                    payloads.push(value.encode()?);
                    puts.push((shape, id));
                }
                Staged::Delete => deletes.push((shape, id)),
            }
        }

        let mut journal = self.journal.lock();
        self.check_poisoned()?;
        let sync = self.config.sync_on_commit;

        let locations = self
            .data
            .append_all(&payloads, sync)
            .map_err(|source| StoreError::Durability {
                xid: xid.clone(),
                source,
            })?;

        let mut trees: Vec<RwLockWriteGuard<'_, BTree>> =
            self.trees.iter().map(|t| t.write()).collect();
        if let Err(e) = Self::apply_index(&mut trees, puts, locations, deletes) {
            Self::discard_pending(&mut trees);
            return Err(Self::commit_error(&xid, e));
        }

        let record = JournalRecord {
            sequence: self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1,
            xid: xid.to_string(),
            trees: Shape::ALL
                .into_iter()
                .filter(|s| trees[s.index()].io().has_pending())
                .map(|s| (s, trees[s.index()].io().pending_ops()))
                .collect(),
        };
        if let Err(source) = journal.write(&record, sync) {
            Self::discard_pending(&mut trees);
            return Err(StoreError::Durability { xid, source });
        }

        let flushed = self.check_crash_point().map_err(StoreError::from).and_then(|_| {
            for tree in trees.iter_mut() {
                tree.io_mut().flush(sync)?;
            }
            Ok(())
        });
        if let Err(e) = flushed {
            Self::discard_pending(&mut trees);
            self.poisoned.store(true, Ordering::SeqCst);
            error!(xid = %xid, sequence = record.sequence, error = %e, "page flush failed after journal write, store poisoned");
            return Err(StoreError::StorePoisoned);
        }
        drop(trees);

        if let Err(e) = journal.clear(sync) {
            // the record is idempotent and the next commit replaces it
            warn!(sequence = record.sequence, error = %e, "failed to clear commit journal");
        }
        debug!(xid = %xid, sequence = record.sequence, "commit applied");
        Ok(())
    }

    fn apply_index(
        trees: &mut [RwLockWriteGuard<'_, BTree>],
        puts: Vec<(Shape, FsId)>,
        locations: Vec<crate::location::Location>,
        deletes: Vec<(Shape, FsId)>,
    ) -> StoreResult<()> {
        for ((shape, id), location) in puts.into_iter().zip(locations) {
            trees[shape.index()].insert(id, location)?;
        }
        for (shape, id) in deletes {
            trees[shape.index()].delete(&id)?;
        }
        Ok(())
    }

    fn discard_pending(trees: &mut [RwLockWriteGuard<'_, BTree>]) {
        for tree in trees.iter_mut() {
            tree.io_mut().discard_pending();
        }
    }

    fn commit_error(xid: &Xid, e: StoreError) -> StoreError {
        match e {
            StoreError::IoError(source) => StoreError::Durability {
                xid: xid.clone(),
                source,
            },
            other => other,
        }
    }

    #[cfg(test)]
    fn check_crash_point(&self) -> io::Result<()> {
        if self.crash_after_journal.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated crash after journal write"));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_crash_point(&self) -> io::Result<()> {
        Ok(())
    }

    fn random_access_batch(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
    ) -> StoreResult<Vec<Option<RandomAccessContent>>> {
        let values = self.load_batch(xid, Shape::RandomAccess, ids)?;
        ids.iter()
            .zip(values)
            .map(|(id, value)| match value {
                Some(StoredValue::RandomAccess(content)) => Ok(Some(content)),
                Some(other) => Err(StoreError::ShapeMismatch {
                    id: id.clone(),
                    expected: Shape::RandomAccess.tree_name(),
                    actual: other.shape().tree_name(),
                }),
                None => Ok(None),
            })
            .collect()
    }

    fn read_series_batch<T: Sample>(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<ReadResult<TimeSeries<T>>>> {
        let contents = self.random_access_batch(xid, ids)?;
        ids.iter()
            .zip(contents)
            .map(|(id, content)| match content {
                Some(content) => Ok(ReadResult::Found(timeseries::read_series(
                    id, &content, start, end,
                )?)),
                None => Ok(ReadResult::NotFound),
            })
            .collect()
    }

    fn write_series_batch<T: Sample>(
        &self,
        xid: &Xid,
        series: &[TimeSeries<T>],
        overwrite: bool,
    ) -> StoreResult<()> {
        for ts in series {
            self.time_series_file(xid, ts.id.clone())?
                .write_series(ts, overwrite)?;
        }
        Ok(())
    }
}

impl TransactionService for FileStore {
    fn begin(&self, context: TransactionContext) -> StoreResult<Xid> {
        self.check_poisoned()?;
        Ok(self.txns.begin(context))
    }

    fn prepare(&self, xid: &Xid) -> StoreResult<()> {
        self.txns.prepare(xid)
    }

    fn commit(&self, xid: &Xid) -> StoreResult<()> {
        let entry = self.txns.entry(xid)?;
        let result = {
            let mut guard = entry.lock();
            self.txns.validate(
                &mut guard,
                "commit",
                &[TransactionState::Active, TransactionState::Preparing],
            )?;
            guard.set_state(TransactionState::Preparing);
            let result = self.commit_entry(&mut guard);
            let state = if result.is_ok() {
                TransactionState::Committed
            } else {
                TransactionState::Aborted
            };
            self.txns.finish(&mut guard, state);
            result
        };
        self.intents.release_all(xid);
        match &result {
            Ok(()) => {
                self.commits.fetch_add(1, Ordering::Relaxed);
                info!(xid = %xid, "transaction committed");
            }
            Err(e) => {
                self.failed_commits.fetch_add(1, Ordering::Relaxed);
                warn!(xid = %xid, error = %e, "commit failed, transaction aborted");
            }
        }
        result
    }

    fn rollback(&self, xid: &Xid) -> StoreResult<()> {
        let entry = self.txns.entry(xid)?;
        {
            let mut guard = entry.lock();
            self.txns.validate(
                &mut guard,
                "rollback",
                &[TransactionState::Active, TransactionState::Preparing],
            )?;
            self.txns.finish(&mut guard, TransactionState::Aborted);
        }
        self.intents.release_all(xid);
        self.aborts.fetch_add(1, Ordering::Relaxed);
        info!(xid = %xid, "transaction rolled back");
        Ok(())
    }

    fn heartbeat(&self, xid: &Xid) -> StoreResult<()> {
        self.txns.heartbeat(xid)
    }
}

impl StoreBackend for FileStore {
    fn write_blob(&self, xid: &Xid, id: &FsId, origin: u64, bytes: &[u8]) -> StoreResult<()> {
        self.stream_file(xid, id.clone())?.replace(origin, bytes)
    }

    fn read_blob(&self, xid: Option<&Xid>, id: &FsId) -> StoreResult<ReadResult<BlobResult>> {
        match self.load(xid, Shape::Stream, id)? {
            Some(StoredValue::Stream(content)) => Ok(ReadResult::Found(content.into_blob())),
            Some(other) => Err(StoreError::ShapeMismatch {
                id: id.clone(),
                expected: Shape::Stream.tree_name(),
                actual: other.shape().tree_name(),
            }),
            None => Ok(ReadResult::NotFound),
        }
    }

    fn blob_exists(&self, xid: Option<&Xid>, id: &FsId) -> StoreResult<bool> {
        Ok(self.load(xid, Shape::Stream, id)?.is_some())
    }

    fn delete_blob(&self, xid: &Xid, id: &FsId) -> StoreResult<()> {
        self.stream_file(xid, id.clone())?.delete()
    }

    fn write_time_series_float(
        &self,
        xid: &Xid,
        series: &[FloatTimeSeries],
        overwrite: bool,
    ) -> StoreResult<()> {
        self.write_series_batch(xid, series, overwrite)
    }

    fn write_time_series_int(
        &self,
        xid: &Xid,
        series: &[IntTimeSeries],
        overwrite: bool,
    ) -> StoreResult<()> {
        self.write_series_batch(xid, series, overwrite)
    }

    fn read_time_series_float(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<ReadResult<FloatTimeSeries>>> {
        self.read_series_batch(xid, ids, start, end)
    }

    fn read_time_series_int(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<ReadResult<IntTimeSeries>>> {
        self.read_series_batch(xid, ids, start, end)
    }

    fn delete_time_series(&self, xid: &Xid, ids: &[FsId]) -> StoreResult<()> {
        for id in ids {
            self.time_series_file(xid, id.clone())?.delete()?;
        }
        Ok(())
    }

    fn cadence_intervals_for_ids(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
    ) -> StoreResult<Vec<ReadResult<CadenceIntervals>>> {
        let contents = self.random_access_batch(xid, ids)?;
        Ok(ids
            .iter()
            .zip(contents)
            .map(|(id, content)| {
                ReadResult::from(content.map(|c| timeseries::cadence_intervals(id, &c)))
            })
            .collect())
    }

    fn write_mjd_time_series(
        &self,
        xid: &Xid,
        series: &[MjdTimeSeries],
        overwrite: bool,
    ) -> StoreResult<()> {
        for ts in series {
            self.mjd_file(xid, ts.id.clone())?.write(ts, overwrite)?;
        }
        Ok(())
    }

    fn read_mjd_time_series(
        &self,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: f64,
        end: f64,
    ) -> StoreResult<Vec<ReadResult<MjdTimeSeries>>> {
        let values = self.load_batch(xid, Shape::Mjd, ids)?;
        ids.iter()
            .zip(values)
            .map(|(id, value)| match value {
                Some(StoredValue::Mjd(content)) => Ok(ReadResult::Found(mjd_series(
                    id, &content, start, end,
                )?)),
                Some(other) => Err(StoreError::ShapeMismatch {
                    id: id.clone(),
                    expected: Shape::Mjd.tree_name(),
                    actual: other.shape().tree_name(),
                }),
                None => Ok(ReadResult::NotFound),
            })
            .collect()
    }

    fn delete_mjd_time_series(&self, xid: &Xid, ids: &[FsId]) -> StoreResult<()> {
        for id in ids {
            self.mjd_file(xid, id.clone())?.delete()?;
        }
        Ok(())
    }

    fn list_ids(&self, shape: Shape, prefix: &str) -> StoreResult<Vec<FsId>> {
        FileStore::list_ids(self, shape, prefix)
    }
}

fn mjd_series(id: &FsId, content: &MjdContent, start: f64, end: f64) -> StoreResult<MjdTimeSeries> {
    MjdTimeSeries::new(id.clone(), start, end, content.read(start, end))
}
