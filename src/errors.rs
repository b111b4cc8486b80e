//! Error types for the storage engine.

use crate::disk::FileId;
use crate::{PageNo, TxnId};
use thiserror::Error;

/// Result type alias using `DbError`.
pub type Result<T> = std::result::Result<T, DbError>;

/// Why a transaction was forced to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A lock could not be granted under the no-wait policy.
    LockOnShrinking,
    /// An acquisition was refused to keep the system deadlock-free.
    DeadlockPrevention,
    /// The client asked for a rollback.
    UserAbort,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::LockOnShrinking => "lock on shrinking",
            AbortReason::DeadlockPrevention => "deadlock prevention",
            AbortReason::UserAbort => "user abort",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {page_no} does not exist in file {file_id}")]
    PageNotExist { file_id: FileId, page_no: PageNo },

    #[error("buffer pool exhausted: all frames are pinned")]
    BufferPoolFull,

    #[error("corrupt file header: {0}")]
    CorruptHeader(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("incompatible types: expected {expected}, got {found}")]
    IncompatibleType { expected: String, found: String },

    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAbort { txn_id: TxnId, reason: AbortReason },

    #[error("invalid state transition for transaction {txn_id}")]
    InvalidTxnState { txn_id: TxnId },
}

impl DbError {
    /// Shorthand for the no-wait lock failure every mutation path can hit.
    pub fn lock_denied(txn_id: TxnId) -> Self {
        DbError::TransactionAbort {
            txn_id,
            reason: AbortReason::LockOnShrinking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_reason_display() {
        let err = DbError::lock_denied(7);
        assert_eq!(err.to_string(), "transaction 7 aborted: lock on shrinking");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DbError = io_err.into();
        assert!(matches!(err, DbError::Io(_)));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DbError>();
    }
}
