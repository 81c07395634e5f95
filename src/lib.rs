//! # KarstDB — Paged Storage and Transaction Core
//!
//! KarstDB is the storage engine of a small relational database: tables
//! persist as fixed-size pages on disk, pages are cached by a pinned
//! buffer pool, rows are addressed by stable record ids inside bitmap-
//! slotted pages, secondary access goes through a disk-resident B+tree,
//! and writes are made transactional with multi-granularity locking and
//! undo-based rollback.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │      Executors (scan / join / DML glue)        │
//! ├───────────────────────────┬────────────────────┤
//! │  SystemManager + Catalog  │ TransactionManager │
//! ├────────────────────┬──────┴───────┬────────────┤
//! │    Record Files    │ B+Tree Index │ LockManager│
//! ├────────────────────┴──────────────┴────────────┤
//! │        Buffer Pool (frames, LRU, pins)         │
//! ├────────────────────────────────────────────────┤
//! │        Disk Manager (paged file I/O)           │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! One directory per database:
//!
//! ```text
//! mydb/
//! ├── db.meta              # textual catalog (JSON), rewritten on DDL
//! ├── users.tbd            # record file, one per table
//! └── users_id.idx         # B+tree file, one per index
//! ```
//!
//! Every file is a sequence of 4 KiB pages; page 0 is the file header.
//! An index file additionally reserves page 1 as the leaf-chain sentinel.
//!
//! ## Concurrency Model
//!
//! Parallel threads share the engine. Each component serializes its
//! externally visible operations with its own mutex; no operation waits on
//! a condition. The lock manager is strictly no-wait: a conflicting
//! request aborts the requester (`AbortReason::DeadlockPrevention`), and
//! under strict two-phase locking all locks are held until commit or
//! abort.

pub mod catalog;
pub mod config;
pub mod errors;
pub mod executor;
pub mod index;
pub mod record;
pub mod storage;
pub mod system;
pub mod txn;

pub use errors::{AbortReason, DbError};
pub use storage::{BufferPoolManager, DiskManager, PageId};
pub use system::SystemManager;
pub use txn::{Context, Transaction, TransactionManager};
