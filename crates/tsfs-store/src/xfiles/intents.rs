//! Per-id write intents: at most one transaction may stage writes to an id.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::ConflictPolicy;
use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::transaction::Xid;

use super::Shape;

/// Table of write intents keyed by `(shape, id)`.
#[derive(Default)]
pub struct WriteIntents {
    holders: Mutex<HashMap<(Shape, FsId), Xid>>,
    released: Condvar,
}

impl WriteIntents {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the intent on `(shape, id)` for `xid`. Re-acquiring an intent
    /// already held by `xid` succeeds. On conflict, `policy` decides between
    /// failing at once and waiting a bounded time for the holder to finish.
    pub fn acquire(
        &self,
        shape: Shape,
        id: &FsId,
        xid: &Xid,
        policy: ConflictPolicy,
    ) -> StoreResult<()> {
        let key = (shape, id.clone());
        let mut holders = self.holders.lock();
        let deadline = match policy {
            ConflictPolicy::FailFast => None,
            ConflictPolicy::Block { wait_ms } => {
                Some(Instant::now() + Duration::from_millis(wait_ms))
            }
        };
        loop {
            match holders.get(&key) {
                None => {
                    holders.insert(key, xid.clone());
                    return Ok(());
                }
                Some(holder) if holder == xid => return Ok(()),
                Some(holder) => {
                    let holder = holder.clone();
                    let Some(deadline) = deadline else {
                        debug!(id = %id, holder = %holder, xid = %xid, "write conflict");
                        return Err(StoreError::WriteConflict {
                            id: id.clone(),
                            holder,
                        });
                    };
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(id = %id, holder = %holder, xid = %xid, "write intent wait expired");
                        return Err(StoreError::WriteConflict {
                            id: id.clone(),
                            holder,
                        });
                    }
                    self.released
                        .wait_for(&mut holders, deadline.duration_since(now));
                }
            }
        }
    }

    /// Releases the intent on one id if `xid` holds it.
    pub fn release(&self, shape: Shape, id: &FsId, xid: &Xid) {
        let mut holders = self.holders.lock();
        let key = (shape, id.clone());
        if holders.get(&key) == Some(xid) {
            holders.remove(&key);
            self.released.notify_all();
        }
    }

    /// Releases every intent held by `xid` and wakes waiting writers.
    pub fn release_all(&self, xid: &Xid) {
        let mut holders = self.holders.lock();
        let before = holders.len();
        holders.retain(|_, holder| holder != xid);
        if holders.len() != before {
            self.released.notify_all();
        }
    }

    /// Current holder of `(shape, id)`.
    pub fn holder(&self, shape: Shape, id: &FsId) -> Option<Xid> {
        self.holders.lock().get(&(shape, id.clone())).cloned()
    }

    /// Number of held intents.
    pub fn len(&self) -> usize {
        self.holders.lock().len()
    }

    /// Returns true if no intent is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn id() -> FsId {
        FsId::parse("/blob/x").unwrap()
    }

    #[test]
    fn test_fail_fast_conflict() {
        let intents = WriteIntents::new();
        let a = Xid::new(1);
        let b = Xid::new(2);
        intents
            .acquire(Shape::Stream, &id(), &a, ConflictPolicy::FailFast)
            .unwrap();
        intents
            .acquire(Shape::Stream, &id(), &a, ConflictPolicy::FailFast)
            .unwrap();
        let err = intents
            .acquire(Shape::Stream, &id(), &b, ConflictPolicy::FailFast)
            .unwrap_err();
        match err {
            StoreError::WriteConflict { holder, .. } => assert_eq!(holder, a),
            other => panic!("unexpected {:?}", other),
        }
        // other shapes are separate namespaces
        intents
            .acquire(Shape::Mjd, &id(), &b, ConflictPolicy::FailFast)
            .unwrap();
    }

    #[test]
    fn test_release_all_frees_ids() {
        let intents = WriteIntents::new();
        let a = Xid::new(1);
        intents
            .acquire(Shape::Stream, &id(), &a, ConflictPolicy::FailFast)
            .unwrap();
        intents
            .acquire(Shape::RandomAccess, &id(), &a, ConflictPolicy::FailFast)
            .unwrap();
        assert_eq!(intents.len(), 2);
        intents.release_all(&a);
        assert!(intents.is_empty());
    }

    #[test]
    fn test_block_times_out() {
        let intents = WriteIntents::new();
        intents
            .acquire(Shape::Stream, &id(), &Xid::new(1), ConflictPolicy::FailFast)
            .unwrap();
        let err = intents
            .acquire(
                Shape::Stream,
                &id(),
                &Xid::new(2),
                ConflictPolicy::Block { wait_ms: 20 },
            )
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[test]
    fn test_block_proceeds_after_release() {
        let intents = Arc::new(WriteIntents::new());
        let a = Xid::new(1);
        let b = Xid::new(2);
        intents
            .acquire(Shape::Stream, &id(), &a, ConflictPolicy::FailFast)
            .unwrap();
        let waiter = {
            let intents = Arc::clone(&intents);
            let b = b.clone();
            thread::spawn(move || {
                intents.acquire(
                    Shape::Stream,
                    &id(),
                    &b,
                    ConflictPolicy::Block { wait_ms: 10_000 },
                )
            })
        };
        thread::sleep(Duration::from_millis(20));
        intents.release_all(&a);
        waiter.join().unwrap().unwrap();
        assert_eq!(intents.holder(Shape::Stream, &id()), Some(b));
    }
}
