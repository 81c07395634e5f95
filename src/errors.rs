//! # Typed Error Surface
//!
//! KarstDB propagates failures as `eyre::Result`, but the conditions a
//! caller is expected to react to are typed: lock conflicts abort the
//! requesting transaction, catalog violations name the offending object,
//! and schema mismatches are distinguishable from storage faults.
//!
//! Typed errors ride inside the `eyre::Report`; recover them with
//! `report.downcast_ref::<DbError>()`:
//!
//! ```ignore
//! match fh.get_record(rid, Some(&ctx)) {
//!     Err(e) if matches!(e.downcast_ref(), Some(DbError::TransactionAbort { .. })) => {
//!         txn_mgr.abort(&txn, &system)?;
//!     }
//!     other => { /* ... */ }
//! }
//! ```

use thiserror::Error;

use crate::catalog::ColType;
use crate::txn::TxnId;

/// Why a transaction was aborted by the lock manager.
///
/// The engine runs a no-wait deadlock-avoidance policy: a request that
/// conflicts with a granted lock never blocks, it kills the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The requested mode conflicts with a lock granted to another
    /// transaction.
    DeadlockPrevention,
    /// The requester holds a weaker lock, and upgrading it in place would
    /// conflict with another granted holder.
    UpgradeConflict,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("page {page_no} does not exist in file {file_id}")]
    PageNotExist { file_id: u32, page_no: i32 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("transaction {txn_id} aborted: {reason:?}")]
    TransactionAbort { txn_id: TxnId, reason: AbortReason },

    #[error("expected {expected} values, got {actual}")]
    InvalidValueCount { expected: usize, actual: usize },

    #[error("incompatible type: expected {expected:?}, got {actual:?}")]
    IncompatibleType { expected: ColType, actual: ColType },

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("index '{0}' already exists")]
    IndexExists(String),

    #[error("index '{0}' not found")]
    IndexNotFound(String),

    #[error("database '{0}' already exists")]
    DatabaseExists(String),

    #[error("database '{0}' not found")]
    DatabaseNotFound(String),
}

impl DbError {
    /// True for the conflict errors that should unwind into
    /// `TransactionManager::abort`.
    pub fn is_abort(&self) -> bool {
        matches!(self, DbError::TransactionAbort { .. })
    }
}
