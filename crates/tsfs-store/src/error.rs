//! Error types for the file store.

use thiserror::Error;

use crate::fsid::FsId;
use crate::transaction::{TransactionState, Xid};

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification used by callers to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The id has no committed value.
    NotFound,
    /// Another transaction holds a write intent; retry immediately.
    Conflict,
    /// The transaction was reaped; retry with backoff.
    Timeout,
    /// A disk error during commit; abort the job.
    Durability,
    /// On-disk structures failed verification; abort the job.
    Corruption,
    /// Misuse of the API (bad id, wrong state, missing transaction).
    Usage,
}

/// Error variants for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps standard I/O errors outside of commit processing.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The caller required the id to exist but it has no committed value.
    #[error("FsId not found: {id}")]
    IdNotFound {
        /// The id that was not found.
        id: FsId,
    },

    /// The id could not be parsed or violates the id grammar.
    #[error("Invalid FsId \"{id}\": {reason}")]
    InvalidFsId {
        /// The offending text.
        id: String,
        /// Description of the problem.
        reason: String,
    },

    /// Another transaction already holds the write intent on this id.
    #[error("Write conflict on {id}: held by transaction {holder}")]
    WriteConflict {
        /// The contended id.
        id: FsId,
        /// The transaction holding the intent.
        holder: Xid,
    },

    /// The transaction was force-aborted by the reaper after idling too long.
    #[error("Transaction {xid} timed out")]
    TransactionTimedOut {
        /// The expired transaction.
        xid: Xid,
    },

    /// The transaction is unknown to this store.
    #[error("Transaction {xid} does not exist")]
    TransactionNotFound {
        /// The unknown transaction.
        xid: Xid,
    },

    /// The transaction is not in a state that permits the operation.
    #[error("Transaction {xid} is {state:?}, cannot {operation}")]
    InvalidTransactionState {
        /// The transaction.
        xid: Xid,
        /// Its current state.
        state: TransactionState,
        /// The rejected operation.
        operation: &'static str,
    },

    /// A client session operation needs an open transaction.
    #[error("No transaction is open on this session")]
    NoTransaction,

    /// A client session already has an open transaction.
    #[error("Transaction {xid} is already open on this session")]
    TransactionAlreadyOpen {
        /// The open transaction.
        xid: Xid,
    },

    /// Disk error during commit. Prior committed state is intact.
    #[error("Commit of transaction {xid} failed: {source}")]
    Durability {
        /// The transaction whose commit failed.
        xid: Xid,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A commit failed after its journal record became durable. The store
    /// must be reopened so recovery can replay the journal.
    #[error("Store is poisoned after a failed page flush; reopen to recover")]
    StorePoisoned,

    /// A store-wide maintenance operation found live transactions.
    #[error("Store has {open_transactions} live transactions")]
    StoreBusy {
        /// Transactions that are neither finished nor expired.
        open_transactions: usize,
    },

    /// On-disk structure failed verification.
    #[error("Corruption detected: {reason}")]
    Corruption {
        /// Description of the inconsistency.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },

    /// The stored value has a different shape than the operation expects.
    #[error("FsId {id} holds {actual}, expected {expected}")]
    ShapeMismatch {
        /// The id.
        id: FsId,
        /// What the caller asked for.
        expected: &'static str,
        /// What is stored.
        actual: &'static str,
    },

    /// Invalid argument to an operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Classifies this error per the store's retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::IdNotFound { .. } => ErrorClass::NotFound,
            StoreError::WriteConflict { .. } | StoreError::StoreBusy { .. } => ErrorClass::Conflict,
            StoreError::TransactionTimedOut { .. } => ErrorClass::Timeout,
            StoreError::IoError(_) | StoreError::Durability { .. } | StoreError::StorePoisoned => {
                ErrorClass::Durability
            }
            StoreError::Corruption { .. } | StoreError::SerializationError { .. } => {
                ErrorClass::Corruption
            }
            StoreError::InvalidFsId { .. }
            | StoreError::TransactionNotFound { .. }
            | StoreError::InvalidTransactionState { .. }
            | StoreError::NoTransaction
            | StoreError::TransactionAlreadyOpen { .. }
            | StoreError::ShapeMismatch { .. }
            | StoreError::InvalidArgument(_)
            | StoreError::InvalidConfig(_) => ErrorClass::Usage,
        }
    }

    /// Returns true if the caller may retry the whole transaction.
    pub fn is_retriable(&self) -> bool {
        matches!(self.class(), ErrorClass::Conflict | ErrorClass::Timeout)
    }

    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        StoreError::Corruption {
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::SerializationError {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xid() -> Xid {
        Xid::new(7)
    }

    #[test]
    fn test_store_result_alias() {
        let ok: StoreResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: StoreResult<i32> = Err(StoreError::NoTransaction);
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StoreError = std_err.into();
        assert!(matches!(err, StoreError::IoError(_)));
        assert_eq!(err.class(), ErrorClass::Durability);
    }

    #[test]
    fn test_conflict_is_retriable() {
        let err = StoreError::WriteConflict {
            id: FsId::parse("/a/b").unwrap(),
            holder: xid(),
        };
        assert!(err.is_retriable());
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(format!("{}", err).contains("/a/b"));
    }

    #[test]
    fn test_timeout_is_distinct() {
        let err = StoreError::TransactionTimedOut { xid: xid() };
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_durability_not_retriable() {
        let err = StoreError::Durability {
            xid: xid(),
            source: std::io::Error::other("disk gone"),
        };
        assert!(!err.is_retriable());
        assert!(format!("{}", err).contains("disk gone"));
    }

    #[test]
    fn test_corruption_message() {
        let err = StoreError::corruption("bad page crc at 4096");
        assert_eq!(
            format!("{}", err),
            "Corruption detected: bad page crc at 4096"
        );
        assert_eq!(err.class(), ErrorClass::Corruption);
    }

    #[test]
    fn test_not_found_class() {
        let err = StoreError::IdNotFound {
            id: FsId::parse("/pdc/sap/100").unwrap(),
        };
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert_eq!(format!("{}", err), "FsId not found: /pdc/sap/100");
    }
}
