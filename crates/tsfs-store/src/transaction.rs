//! Transaction identifiers, lifecycle tracking and idle-timeout reaping.
//!
//! Each transaction lives in its own mutex inside a concurrent map, so work
//! on unrelated transactions never contends. Commit processing holds the
//! transaction's mutex for its whole duration; the reaper only `try_lock`s
//! and therefore never aborts a transaction that is mid-commit.
//!
//! The monitoring row of a transaction sits behind a separate short-lived
//! lock, so the transaction table stays readable while a commit is running.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::xfiles::{Shape, StoredValue};

/// Transaction identifier: a process-unique sequence number plus a
/// globally unique id. The textual form is the global id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    simple_id: u64,
    global_id: Uuid,
}

impl Xid {
    /// Creates an id with sequence number `simple_id` and a fresh UUID.
    pub fn new(simple_id: u64) -> Self {
        Self {
            simple_id,
            global_id: Uuid::new_v4(),
        }
    }

    /// The process-unique sequence number.
    pub fn simple_id(&self) -> u64 {
        self.simple_id
    }

    /// The globally unique id.
    pub fn global_id(&self) -> Uuid {
        self.global_id
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.global_id)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting reads and writes.
    Active,
    /// Commit processing has started.
    Preparing,
    /// Changes are durable and visible.
    Committed,
    /// Changes were discarded.
    Aborted,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Active => "ACTIVE",
            TransactionState::Preparing => "PREPARING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Who opened a transaction, for monitoring correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContext {
    /// Originating host.
    pub host: String,
    /// Pipeline task that opened the transaction, if any.
    pub pipeline_task_id: Option<u64>,
}

impl TransactionContext {
    /// Context for `host` with no pipeline task.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            pipeline_task_id: None,
        }
    }

    /// Sets the pipeline task id.
    pub fn with_task(mut self, pipeline_task_id: u64) -> Self {
        self.pipeline_task_id = Some(pipeline_task_id);
        self
    }
}

/// Read-only view of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// The transaction.
    pub xid: Xid,
    /// Originating host.
    pub host: String,
    /// Pipeline task that opened it.
    pub pipeline_task_id: Option<u64>,
    /// When it began.
    pub start_time: SystemTime,
    /// When it was last used.
    pub last_active_time: SystemTime,
    /// Current state.
    pub state: TransactionState,
    /// Whether the reaper aborted it.
    pub expired: bool,
}

/// A staged change to one id.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Staged {
    Put(StoredValue),
    Delete,
}

pub(crate) type StageKey = (Shape, FsId);

pub(crate) struct TransactionEntry {
    xid: Xid,
    info: Arc<Mutex<TransactionInfo>>,
    pub(crate) staged: BTreeMap<StageKey, Staged>,
    last_active: Instant,
    expired_at: Option<Instant>,
}

impl TransactionEntry {
    pub(crate) fn xid(&self) -> &Xid {
        &self.xid
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.info.lock().state
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.info.lock().state = state;
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
        self.info.lock().last_active_time = SystemTime::now();
    }

    fn expire(&mut self, now: Instant) {
        self.expired_at = Some(now);
        self.staged.clear();
        let mut info = self.info.lock();
        info.state = TransactionState::Aborted;
        info.expired = true;
    }
}

/// Lifecycle operations of the transaction boundary.
pub trait TransactionService: Send + Sync {
    /// Starts a transaction.
    fn begin(&self, context: TransactionContext) -> StoreResult<Xid>;
    /// Moves an active transaction to `Preparing`.
    fn prepare(&self, xid: &Xid) -> StoreResult<()>;
    /// Makes the transaction's writes durable and visible. Runs prepare
    /// implicitly on an active transaction.
    fn commit(&self, xid: &Xid) -> StoreResult<()>;
    /// Discards the transaction's writes.
    fn rollback(&self, xid: &Xid) -> StoreResult<()>;
    /// Resets the idle timer.
    fn heartbeat(&self, xid: &Xid) -> StoreResult<()>;
}

/// Registry of live transactions.
pub struct TransactionManager {
    next_simple_id: AtomicU64,
    entries: DashMap<Xid, Arc<Mutex<TransactionEntry>>>,
    rows: DashMap<Xid, Arc<Mutex<TransactionInfo>>>,
    timeout: Duration,
    retention: Duration,
}

impl TransactionManager {
    /// Creates a manager that expires transactions idle for `timeout` and
    /// keeps expired ones visible for `retention`.
    pub fn new(timeout: Duration, retention: Duration) -> Self {
        Self {
            next_simple_id: AtomicU64::new(1),
            entries: DashMap::new(),
            rows: DashMap::new(),
            timeout,
            retention,
        }
    }

    /// Registers a new active transaction.
    pub fn begin(&self, context: TransactionContext) -> Xid {
        let xid = Xid::new(self.next_simple_id.fetch_add(1, Ordering::SeqCst));
        let now = SystemTime::now();
        let info = Arc::new(Mutex::new(TransactionInfo {
            xid: xid.clone(),
            host: context.host,
            pipeline_task_id: context.pipeline_task_id,
            start_time: now,
            last_active_time: now,
            state: TransactionState::Active,
            expired: false,
        }));
        let entry = TransactionEntry {
            xid: xid.clone(),
            info: Arc::clone(&info),
            staged: BTreeMap::new(),
            last_active: Instant::now(),
            expired_at: None,
        };
        self.rows.insert(xid.clone(), info);
        self.entries.insert(xid.clone(), Arc::new(Mutex::new(entry)));
        debug!(xid = %xid, simple_id = xid.simple_id(), "began transaction");
        xid
    }

    pub(crate) fn entry(&self, xid: &Xid) -> StoreResult<Arc<Mutex<TransactionEntry>>> {
        self.entries
            .get(xid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StoreError::TransactionNotFound { xid: xid.clone() })
    }

    fn forget(&self, xid: &Xid) {
        self.entries.remove(xid);
        self.rows.remove(xid);
    }

    /// Checks that `entry` may perform `operation` in one of `allowed`
    /// states. An expired transaction reports the timeout on every use
    /// until the reaper forgets it.
    pub(crate) fn validate(
        &self,
        entry: &mut TransactionEntry,
        operation: &'static str,
        allowed: &[TransactionState],
    ) -> StoreResult<()> {
        if entry.expired_at.is_some() {
            return Err(StoreError::TransactionTimedOut {
                xid: entry.xid.clone(),
            });
        }
        let state = entry.state();
        if !allowed.contains(&state) {
            return Err(StoreError::InvalidTransactionState {
                xid: entry.xid.clone(),
                state,
                operation,
            });
        }
        entry.touch();
        Ok(())
    }

    /// Runs `f` on an active transaction, refreshing its idle timer.
    pub(crate) fn with_active<R>(
        &self,
        xid: &Xid,
        operation: &'static str,
        f: impl FnOnce(&mut TransactionEntry) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let entry = self.entry(xid)?;
        let mut guard = entry.lock();
        self.validate(&mut guard, operation, &[TransactionState::Active])?;
        f(&mut guard)
    }

    /// Moves an active transaction to `Preparing`.
    pub fn prepare(&self, xid: &Xid) -> StoreResult<()> {
        self.with_active(xid, "prepare", |entry| {
            entry.set_state(TransactionState::Preparing);
            Ok(())
        })
    }

    /// Resets the idle timer of an active transaction.
    pub fn heartbeat(&self, xid: &Xid) -> StoreResult<()> {
        self.with_active(xid, "heartbeat", |_| Ok(()))
    }

    /// Marks a transaction finished and forgets it.
    pub(crate) fn finish(&self, entry: &mut TransactionEntry, state: TransactionState) {
        entry.set_state(state);
        entry.staged.clear();
        self.forget(&entry.xid);
        debug!(xid = %entry.xid, state = %state, "transaction finished");
    }

    /// Force-aborts every active transaction idle for longer than the
    /// timeout and forgets expired records past their retention. Returns
    /// the newly expired transactions.
    pub fn reap_expired(&self) -> Vec<Xid> {
        self.reap_expired_at(Instant::now())
    }

    /// [`reap_expired`](Self::reap_expired) against an explicit clock.
    pub fn reap_expired_at(&self, now: Instant) -> Vec<Xid> {
        let mut expired = Vec::new();
        let mut forget = Vec::new();
        let entries: Vec<Arc<Mutex<TransactionEntry>>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            // a transaction that is mid-operation is not idle
            let Some(mut guard) = entry.try_lock() else {
                continue;
            };
            if let Some(at) = guard.expired_at {
                if now.saturating_duration_since(at) >= self.retention {
                    forget.push(guard.xid.clone());
                }
                continue;
            }
            if guard.state() == TransactionState::Active
                && now.saturating_duration_since(guard.last_active) > self.timeout
            {
                guard.expire(now);
                let info = guard.info.lock().clone();
                warn!(
                    xid = %info.xid,
                    host = %info.host,
                    pipeline_task_id = ?info.pipeline_task_id,
                    "transaction idle past timeout, aborted"
                );
                expired.push(info.xid);
            }
        }
        for xid in &forget {
            self.forget(xid);
        }
        if !expired.is_empty() || !forget.is_empty() {
            info!(expired = expired.len(), forgotten = forget.len(), "reaper pass");
        }
        expired
    }

    /// Monitoring rows of every known transaction, ordered by simple id,
    /// including transactions in the middle of a commit.
    pub fn snapshot(&self) -> Vec<TransactionInfo> {
        let mut rows: Vec<TransactionInfo> =
            self.rows.iter().map(|r| r.value().lock().clone()).collect();
        rows.sort_by_key(|r| r.xid.simple_id());
        rows
    }

    /// Number of known transactions, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no transaction is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TransactionManager {
        TransactionManager::new(Duration::from_secs(10), Duration::from_secs(60))
    }

    #[test]
    fn test_xids_are_unique() {
        let mgr = manager();
        let a = mgr.begin(TransactionContext::new("h"));
        let b = mgr.begin(TransactionContext::new("h"));
        assert_ne!(a, b);
        assert_eq!(b.simple_id(), a.simple_id() + 1);
        assert_eq!(a.to_string(), a.global_id().to_string());
    }

    #[test]
    fn test_prepare_then_heartbeat_rejected() {
        let mgr = manager();
        let xid = mgr.begin(TransactionContext::new("h"));
        mgr.prepare(&xid).unwrap();
        let err = mgr.heartbeat(&xid).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransactionState {
                state: TransactionState::Preparing,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_transaction() {
        let mgr = manager();
        let err = mgr.heartbeat(&Xid::new(99)).unwrap_err();
        assert!(matches!(err, StoreError::TransactionNotFound { .. }));
    }

    #[test]
    fn test_reaper_expires_idle_and_keeps_reporting_timeout() {
        let mgr = manager();
        let idle = mgr.begin(TransactionContext::new("h").with_task(12));
        let now = Instant::now();
        let expired = mgr.reap_expired_at(now + Duration::from_secs(11));
        assert_eq!(expired, vec![idle.clone()]);

        let rows = mgr.snapshot();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].expired);
        assert_eq!(rows[0].state, TransactionState::Aborted);
        assert_eq!(rows[0].pipeline_task_id, Some(12));

        for _ in 0..3 {
            assert!(matches!(
                mgr.heartbeat(&idle),
                Err(StoreError::TransactionTimedOut { .. })
            ));
        }
        assert!(matches!(
            mgr.prepare(&idle),
            Err(StoreError::TransactionTimedOut { .. })
        ));
        assert_eq!(mgr.len(), 1);

        // once retention passes the record is gone
        mgr.reap_expired_at(now + Duration::from_secs(11 + 61));
        assert!(matches!(
            mgr.heartbeat(&idle),
            Err(StoreError::TransactionNotFound { .. })
        ));
        assert!(mgr.snapshot().is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_transaction_alive() {
        let mgr = manager();
        let xid = mgr.begin(TransactionContext::new("h"));
        assert!(mgr.reap_expired_at(Instant::now() + Duration::from_secs(5)).is_empty());
        mgr.heartbeat(&xid).unwrap();
        assert!(mgr.reap_expired_at(Instant::now() + Duration::from_secs(9)).is_empty());
        assert_eq!(mgr.snapshot()[0].state, TransactionState::Active);
    }

    #[test]
    fn test_expired_records_forgotten_after_retention() {
        let mgr = manager();
        mgr.begin(TransactionContext::new("h"));
        let t0 = Instant::now() + Duration::from_secs(11);
        assert_eq!(mgr.reap_expired_at(t0).len(), 1);
        assert_eq!(mgr.len(), 1);
        mgr.reap_expired_at(t0 + Duration::from_secs(61));
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_snapshot_sees_transaction_held_by_commit() {
        let mgr = manager();
        let xid = mgr.begin(TransactionContext::new("h").with_task(3));
        let entry = mgr.entry(&xid).unwrap();
        let mut held = entry.lock();
        held.set_state(TransactionState::Preparing);

        let rows = mgr.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].xid, xid);
        assert_eq!(rows[0].state, TransactionState::Preparing);
        assert_eq!(rows[0].pipeline_task_id, Some(3));

        mgr.finish(&mut held, TransactionState::Committed);
        drop(held);
        assert!(mgr.snapshot().is_empty());
    }

    #[test]
    fn test_busy_transaction_not_reaped() {
        let mgr = manager();
        let xid = mgr.begin(TransactionContext::new("h"));
        let entry = mgr.entry(&xid).unwrap();
        let _held = entry.lock();
        assert!(mgr
            .reap_expired_at(Instant::now() + Duration::from_secs(100))
            .is_empty());
    }
}
