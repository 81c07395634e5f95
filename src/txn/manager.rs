//! # Transaction Manager
//!
//! Owns the process-wide transaction map and the id generator, and
//! implements the three lifecycle operations:
//!
//! - `begin` registers a fresh transaction in the `Growing` state;
//! - `commit` releases every held lock and marks `Committed`;
//! - `abort` walks the write set backwards undoing each mutation, then
//!   releases locks and marks `Aborted`.
//!
//! ## Undo Protocol
//!
//! The write set is snapshotted at entry and replayed in reverse:
//!
//! ```text
//! INSERT  → delete the entry from every index (key recomputed from the
//!           stored image), then delete the record at its rid
//! DELETE  → re-insert the record byte-for-byte at its original rid,
//!           then re-insert the index entries
//! UPDATE  → read the current (post-image) record, delete its index
//!           entries, restore the before-image, insert index entries
//!           computed from the before-image
//! ```
//!
//! Undo calls pass no locking context: they run under the aborting
//! transaction's own privilege and append nothing to the log being
//! drained. Indexes (or whole tables) dropped since the write happened
//! are skipped silently — rollback restores whatever still exists.
//! Locks are released from a snapshot of the lock set on both commit and
//! abort, making either safe to call from any unwind point.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use log::debug;
use parking_lot::Mutex;

use super::{LockManager, Transaction, TxnId, TxnState, WriteKind};
use crate::system::SystemManager;

pub struct TransactionManager {
    lock_mgr: Arc<LockManager>,
    next_txn_id: AtomicU32,
    next_ts: AtomicU64,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_mgr: Arc<LockManager>) -> Self {
        Self {
            lock_mgr,
            next_txn_id: AtomicU32::new(1),
            next_ts: AtomicU64::new(1),
            txn_map: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    /// Starts a transaction and registers it in the transaction map.
    pub fn begin(&self) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id, ts));
        self.txn_map.lock().insert(id, Arc::clone(&txn));
        txn
    }

    pub fn get_transaction(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().get(&id).cloned()
    }

    /// Commits: releases the lock set (snapshot first) and marks the
    /// transaction `Committed`. Writes are already in place.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.release_locks(txn);
        txn.set_state(TxnState::Committed);
        Ok(())
    }

    /// Aborts: undoes the write set in reverse order against `system`,
    /// then releases locks and marks `Aborted`.
    pub fn abort(&self, txn: &Arc<Transaction>, system: &SystemManager) -> Result<()> {
        let writes = txn.write_snapshot();
        debug!("aborting txn {}: undoing {} writes", txn.id(), writes.len());

        for wr in writes.iter().rev() {
            // A table dropped inside this very transaction has nothing
            // left to restore.
            let fh = match system.table_file(&wr.table) {
                Ok(fh) => fh,
                Err(_) => continue,
            };
            let indexes = system
                .table_meta(&wr.table)
                .map(|t| t.indexes)
                .unwrap_or_default();

            match wr.kind {
                WriteKind::Insert => {
                    for index in &indexes {
                        if let Some(ih) = system.index_handle(&wr.table, &index.col_names()) {
                            ih.delete_entry(&index.key_from_tuple(wr.image.data()))?;
                        }
                    }
                    fh.delete_record(wr.rid, None)?;
                }
                WriteKind::Delete => {
                    fh.insert_record_at(wr.rid, wr.image.data())?;
                    for index in &indexes {
                        if let Some(ih) = system.index_handle(&wr.table, &index.col_names()) {
                            ih.insert_entry(&index.key_from_tuple(wr.image.data()), wr.rid)?;
                        }
                    }
                }
                WriteKind::Update => {
                    let current = fh.get_record(wr.rid, None)?;
                    for index in &indexes {
                        if let Some(ih) = system.index_handle(&wr.table, &index.col_names()) {
                            ih.delete_entry(&index.key_from_tuple(current.data()))?;
                        }
                    }
                    fh.update_record(wr.rid, wr.image.data(), None)?;
                    for index in &indexes {
                        if let Some(ih) = system.index_handle(&wr.table, &index.col_names()) {
                            ih.insert_entry(&index.key_from_tuple(wr.image.data()), wr.rid)?;
                        }
                    }
                }
            }
        }

        self.release_locks(txn);
        txn.set_state(TxnState::Aborted);
        Ok(())
    }

    /// Releases every lock in the set. Snapshots first so the set is not
    /// mutated while being iterated.
    fn release_locks(&self, txn: &Arc<Transaction>) {
        for data_id in txn.locks_snapshot() {
            self.lock_mgr.unlock(txn, data_id);
        }
        txn.clear_locks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{LockDataId, LockMode};

    #[test]
    fn begin_assigns_unique_ids_and_registers() {
        let tm = TransactionManager::new(Arc::new(LockManager::new()));
        let t1 = tm.begin();
        let t2 = tm.begin();
        assert_ne!(t1.id(), t2.id());
        assert_eq!(t1.state(), TxnState::Growing);
        assert!(tm.get_transaction(t1.id()).is_some());
        assert!(tm.get_transaction(t2.id()).is_some());
    }

    #[test]
    fn commit_releases_locks_and_marks_committed() {
        let lm = Arc::new(LockManager::new());
        let tm = TransactionManager::new(Arc::clone(&lm));
        let t1 = tm.begin();
        let id = LockDataId::table(7);
        lm.lock(&t1, id, LockMode::Exclusive).unwrap();

        tm.commit(&t1).unwrap();
        assert_eq!(t1.state(), TxnState::Committed);

        // The granule is free for others now.
        let t2 = tm.begin();
        lm.lock(&t2, id, LockMode::Exclusive).unwrap();
    }
}
