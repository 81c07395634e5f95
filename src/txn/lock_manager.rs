//! # Lock Manager
//!
//! Multi-granularity locking over tables and records with five modes and
//! a strict no-wait policy: a request that conflicts with a lock granted
//! to another transaction never blocks, it aborts the requester
//! (deadlock avoidance by construction — no waits, no wait-for cycles).
//!
//! ## Compatibility (request vs. held)
//!
//! ```text
//!  req\held │ IS  IX  S   SIX  X
//!  ─────────┼────────────────────
//!  IS       │ ✓   ✓   ✓   ✓    ✗
//!  IX       │ ✓   ✓   ✗   ✗    ✗
//!  S        │ ✓   ✗   ✓   ✗    ✗
//!  SIX      │ ✓   ✗   ✗   ✗    ✗
//!  X        │ ✗   ✗   ✗   ✗    ✗
//! ```
//!
//! ## Reentrancy and Upgrades
//!
//! A transaction re-requesting a granule it already holds succeeds
//! immediately when the held mode covers the request in the lattice
//! `X > SIX > {S, IX} > IS`. Otherwise the held entry is upgraded in
//! place to the least upper bound of the two modes (`S + IX = SIX`),
//! provided no *other* granted holder conflicts with the target; a
//! conflicting upgrade aborts the requester with `UPGRADE_CONFLICT`.
//!
//! Granted locks are recorded in the transaction's lock set and stay put
//! until the transaction manager releases them at commit or abort
//! (strict 2PL).

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{Transaction, TxnId, TxnState};
use crate::errors::{AbortReason, DbError};
use crate::record::Rid;

/// A lockable granule: a whole table or one record in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table { file_id: u32 },
    Record { file_id: u32, rid: Rid },
}

impl LockDataId {
    pub fn table(file_id: u32) -> Self {
        Self::Table { file_id }
    }

    pub fn record(file_id: u32, rid: Rid) -> Self {
        Self::Record { file_id, rid }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Whether a request in `self` may coexist with a granted `held`.
    pub fn compatible_with(self, held: LockMode) -> bool {
        use LockMode::*;
        match (self, held) {
            (IntentionShared, Exclusive) => false,
            (IntentionShared, _) => true,
            (IntentionExclusive, IntentionShared) | (IntentionExclusive, IntentionExclusive) => true,
            (IntentionExclusive, _) => false,
            (Shared, IntentionShared) | (Shared, Shared) => true,
            (Shared, _) => false,
            (SharedIntentionExclusive, IntentionShared) => true,
            (SharedIntentionExclusive, _) => false,
            (Exclusive, _) => false,
        }
    }

    /// Whether holding `self` already satisfies a request for `req`
    /// (the lattice `X > SIX > {S, IX} > IS`).
    pub fn covers(self, req: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            SharedIntentionExclusive => req != Exclusive,
            Shared => matches!(req, Shared | IntentionShared),
            IntentionExclusive => matches!(req, IntentionExclusive | IntentionShared),
            IntentionShared => req == IntentionShared,
        }
    }

    /// Least upper bound of two modes in the lattice; the target of an
    /// in-place upgrade.
    pub fn lub(a: LockMode, b: LockMode) -> LockMode {
        use LockMode::*;
        if a == Exclusive || b == Exclusive {
            return Exclusive;
        }
        if a == SharedIntentionExclusive || b == SharedIntentionExclusive {
            return SharedIntentionExclusive;
        }
        match (a, b) {
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => {
                SharedIntentionExclusive
            }
            (Shared, _) | (_, Shared) => Shared,
            (IntentionExclusive, _) | (_, IntentionExclusive) => IntentionExclusive,
            _ => IntentionShared,
        }
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: Vec<LockRequest>,
}

#[derive(Debug, Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockRequestQueue>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `mode` on `data_id` for `txn`, or aborts the transaction.
    ///
    /// On conflict the transaction is marked `Aborted` and a typed
    /// [`DbError::TransactionAbort`] is returned; the caller unwinds to
    /// `TransactionManager::abort`.
    pub fn lock(&self, txn: &Transaction, data_id: LockDataId, mode: LockMode) -> eyre::Result<()> {
        let mut table = self.lock_table.lock();
        let queue = table.entry(data_id).or_default();

        // Reentrant request or in-place upgrade.
        if let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
        {
            let held = queue.requests[pos].mode;
            if held.covers(mode) {
                return Ok(());
            }
            let target = LockMode::lub(held, mode);
            let blocked = queue.requests.iter().any(|r| {
                r.granted && r.txn_id != txn.id() && !target.compatible_with(r.mode)
            });
            if blocked {
                txn.set_state(TxnState::Aborted);
                return Err(DbError::TransactionAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::UpgradeConflict,
                }
                .into());
            }
            queue.requests[pos].mode = target;
            return Ok(());
        }

        // Fresh request: no-wait conflict check against granted holders.
        let blocked = queue
            .requests
            .iter()
            .any(|r| r.granted && r.txn_id != txn.id() && !mode.compatible_with(r.mode));
        if blocked {
            txn.set_state(TxnState::Aborted);
            return Err(DbError::TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::DeadlockPrevention,
            }
            .into());
        }

        queue.requests.push(LockRequest {
            txn_id: txn.id(),
            mode,
            granted: true,
        });
        txn.record_lock(data_id);
        Ok(())
    }

    /// Drops `txn`'s entry on `data_id`, erasing the queue when it
    /// empties. Returns whether an entry was removed.
    pub fn unlock(&self, txn: &Transaction, data_id: LockDataId) -> bool {
        let mut table = self.lock_table.lock();
        let queue = match table.get_mut(&data_id) {
            Some(q) => q,
            None => return false,
        };
        let before = queue.requests.len();
        queue.requests.retain(|r| r.txn_id != txn.id());
        let removed = queue.requests.len() != before;
        if queue.requests.is_empty() {
            table.remove(&data_id);
        }
        removed
    }

    /// Mode `txn` currently holds on `data_id`, if any.
    pub fn held_mode(&self, txn: &Transaction, data_id: LockDataId) -> Option<LockMode> {
        let table = self.lock_table.lock();
        table.get(&data_id).and_then(|q| {
            q.requests
                .iter()
                .find(|r| r.txn_id == txn.id() && r.granted)
                .map(|r| r.mode)
        })
    }
}
