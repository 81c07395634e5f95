//! # Transactions
//!
//! Strict two-phase locking with undo-based rollback. A transaction
//! accumulates two per-transaction sets while it runs:
//!
//! - the **write set**: an ordered log of record mutations (insert /
//!   delete / update) with the tuple images rollback needs;
//! - the **lock set**: every granule the lock manager granted it, held
//!   until commit or abort.
//!
//! Storage operations receive a [`Context`] bundling the transaction
//! with the lock manager; the context is what turns a plain record-file
//! call into a transactional one. Undo runs *without* a context, so the
//! rollback walk neither takes locks nor extends the write set it is
//! draining.

mod lock_manager;
mod manager;

pub use lock_manager::{LockDataId, LockManager, LockMode};
pub use manager::TransactionManager;

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashSet;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::record::{Record, Rid};

pub type TxnId = u32;

/// Lifecycle of a transaction. Under strict 2PL a transaction spends its
/// whole life in `Growing` and releases everything at termination, so
/// `Shrinking` is never observed between operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Delete,
    Update,
}

/// One entry of the undo log.
///
/// The image is what rollback needs: the inserted tuple for `Insert`
/// (to recompute index keys), the deleted tuple for `Delete`, and the
/// *before* image for `Update`.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub table: String,
    pub rid: Rid,
    pub image: Record,
}

pub struct Transaction {
    id: TxnId,
    start_ts: u64,
    state: Mutex<TxnState>,
    write_set: Mutex<SmallVec<[WriteRecord; 8]>>,
    lock_set: Mutex<HashSet<LockDataId>>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, start_ts: u64) -> Self {
        Self {
            id,
            start_ts,
            state: Mutex::new(TxnState::Growing),
            write_set: Mutex::new(SmallVec::new()),
            lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock() = state;
    }

    pub fn append_write_record(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().len()
    }

    /// Clones the write set as it stands; rollback iterates the snapshot
    /// so its bound is fixed at entry.
    pub(crate) fn write_snapshot(&self) -> Vec<WriteRecord> {
        self.write_set.lock().to_vec()
    }

    pub(crate) fn record_lock(&self, data_id: LockDataId) {
        self.lock_set.lock().insert(data_id);
    }

    pub(crate) fn locks_snapshot(&self) -> Vec<LockDataId> {
        self.lock_set.lock().iter().copied().collect()
    }

    pub(crate) fn clear_locks(&self) {
        self.lock_set.lock().clear();
    }

    pub fn holds_lock(&self, data_id: LockDataId) -> bool {
        self.lock_set.lock().contains(&data_id)
    }
}

/// Per-operation bundle handed into storage calls: the running
/// transaction plus the lock manager to acquire granules through.
#[derive(Clone)]
pub struct Context {
    pub lock_mgr: Arc<LockManager>,
    pub txn: Arc<Transaction>,
}

impl Context {
    pub fn new(lock_mgr: Arc<LockManager>, txn: Arc<Transaction>) -> Self {
        Self { lock_mgr, txn }
    }

    pub fn lock_table(&self, file_id: u32, mode: LockMode) -> Result<()> {
        self.lock_mgr.lock(&self.txn, LockDataId::table(file_id), mode)
    }

    pub fn lock_record(&self, file_id: u32, rid: Rid, mode: LockMode) -> Result<()> {
        self.lock_mgr
            .lock(&self.txn, LockDataId::record(file_id, rid), mode)
    }
}
