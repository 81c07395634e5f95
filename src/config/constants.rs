//! # Engine Constants
//!
//! Centralizes the page geometry and the sentinel page numbers the on-disk
//! formats depend on. Constants that derive from one another are co-located
//! and checked with compile-time assertions so a change to one cannot
//! silently skew the others.
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> FILE_HEADER_SIZE (64 bytes, page 0 of every file)
//!       │
//!       ├─> record page capacity  (derived per table from record_size)
//!       │
//!       └─> B+tree order          (derived per index from key length)
//! ```
//!
//! Page numbers are `i32` with `NO_PAGE = -1` as the universal "none"
//! sentinel: it terminates the record free-page chain, marks an absent
//! parent, and stands for the root of an empty tree.

/// Size of every database page in bytes. The unit of disk I/O and caching.
pub const PAGE_SIZE: usize = 4096;

/// Size of the file header stored at the start of page 0 of every file.
pub const FILE_HEADER_SIZE: usize = 64;

/// Number of frames in the buffer pool.
pub const BUFFER_POOL_SIZE: usize = 256;

/// Universal "no page" sentinel.
pub const NO_PAGE: i32 = -1;

/// Universal "no slot" sentinel.
pub const NO_SLOT: i32 = -1;

/// Page 0 of every file holds its header.
pub const FILE_HDR_PAGE: i32 = 0;

/// First data page of a record file.
pub const RM_FIRST_RECORD_PAGE: i32 = 1;

/// Page 1 of an index file is the leaf-chain sentinel node. Its `prev_leaf`
/// points at the last real leaf and its `next_leaf` at the first, so the
/// doubly-linked chain has no null-neighbor cases.
pub const IX_LEAF_HEADER_PAGE: i32 = 1;

/// First page number available to real B+tree nodes.
pub const IX_FIRST_NODE_PAGE: i32 = 2;

/// Maximum number of columns in a composite index key. Bounds the fixed
/// column arrays in the index file header.
pub const MAX_INDEX_COLS: usize = 4;

/// Name of the textual catalog metadata file inside a database directory.
pub const DB_META_FILE: &str = "db.meta";

/// Current on-disk format version, validated against file headers on open.
pub const FORMAT_VERSION: u32 = 1;

const _: () = assert!(
    FILE_HEADER_SIZE < PAGE_SIZE,
    "file header must fit in page 0"
);

const _: () = assert!(PAGE_SIZE % 512 == 0, "pages must be sector aligned");
