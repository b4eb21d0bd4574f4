//! Stream files: whole payloads that are appended to or replaced, never
//! patched in place. Blobs are stream files.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::series::BlobResult;
use crate::store::FileStore;
use crate::transaction::Xid;

use super::{ReadResult, Shape, StoredValue};

/// Content of a stream file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamContent {
    /// Producer of the most recent write.
    pub origin: u64,
    /// The payload.
    pub bytes: Vec<u8>,
}

impl StreamContent {
    /// Creates content produced by `origin`.
    pub fn new(origin: u64, bytes: Vec<u8>) -> Self {
        Self { origin, bytes }
    }

    /// Converts into the client-facing blob type.
    pub fn into_blob(self) -> BlobResult {
        BlobResult {
            origin: self.origin,
            data: self.bytes,
        }
    }
}

/// A stream file bound to a transaction.
pub struct TransactionalStreamFile<'a> {
    store: &'a FileStore,
    xid: Xid,
    id: FsId,
}

impl<'a> TransactionalStreamFile<'a> {
    pub(crate) fn new(store: &'a FileStore, xid: Xid, id: FsId) -> Self {
        Self { store, xid, id }
    }

    /// The file's id.
    pub fn id(&self) -> &FsId {
        &self.id
    }

    /// Stages `bytes` appended to the current payload.
    pub fn append(&self, origin: u64, bytes: &[u8]) -> StoreResult<()> {
        self.store
            .modify(&self.xid, Shape::Stream, &self.id, |current| {
                let mut content = match current {
                    Some(StoredValue::Stream(c)) => c,
                    _ => StreamContent::default(),
                };
                content.origin = origin;
                content.bytes.extend_from_slice(bytes);
                Ok(Some(StoredValue::Stream(content)))
            })
    }

    /// Stages replacement of the whole payload.
    pub fn replace(&self, origin: u64, bytes: &[u8]) -> StoreResult<()> {
        let content = StreamContent::new(origin, bytes.to_vec());
        self.store
            .modify(&self.xid, Shape::Stream, &self.id, move |_| {
                Ok(Some(StoredValue::Stream(content)))
            })
    }

    /// Reads the payload as seen by the transaction.
    pub fn read_all(&self) -> StoreResult<ReadResult<StreamContent>> {
        match self.store.load(Some(&self.xid), Shape::Stream, &self.id)? {
            Some(StoredValue::Stream(c)) => Ok(ReadResult::Found(c)),
            Some(other) => Err(StoreError::ShapeMismatch {
                id: self.id.clone(),
                expected: Shape::Stream.tree_name(),
                actual: other.shape().tree_name(),
            }),
            None => Ok(ReadResult::NotFound),
        }
    }

    /// Stages removal of the file.
    pub fn delete(&self) -> StoreResult<()> {
        self.store
            .modify(&self.xid, Shape::Stream, &self.id, |_| Ok(None))
    }
}
