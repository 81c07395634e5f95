//! # B+Tree Handle
//!
//! One handle owns one index file: the immutable key layout, the mutable
//! header fields (root, leaf-chain ends, page count), and the structural
//! algorithms. Every public operation runs under a single tree latch, so
//! structural modifications appear atomic to concurrent callers.
//!
//! ## Insert
//!
//! ```text
//! 1. Descend from the root to the target leaf.
//! 2. Sorted-insert into the leaf; duplicates are a no-op.
//! 3. Non-splitting insert: repair ancestor separators (maintain_parent).
//! 4. Leaf reached max_size: split off a right sibling, splice it into
//!    the leaf chain, push (sibling.first_key, sibling) into the parent;
//!    split recursively up to (and including) the root.
//! ```
//!
//! ## Delete
//!
//! ```text
//! 1. Descend to the leaf; erase the key if present.
//! 2. Repair ancestor separators while the leaf is non-empty.
//! 3. Under min_size: rebalance — prefer redistribution from the left
//!    sibling (right for the leftmost child); otherwise merge into the
//!    left party, unlink the right from the leaf chain, drop its parent
//!    slot, and recurse on the parent. A shrinking root is replaced by
//!    its only child; an emptied root clears the tree.
//! ```
//!
//! ## Pin Discipline
//!
//! Nodes wrap [`PageGuard`]s: every fetched page is unpinned exactly once
//! when its `Node` drops, with the dirty flag accumulated from write
//! access. No path leaks a pin.

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use super::node::{init_raw_node, Node, NODE_HDR_SIZE};
use super::{Iid, KeyLayout};
use crate::config::{IX_LEAF_HEADER_PAGE, NO_PAGE, NO_SLOT, PAGE_SIZE};
use crate::errors::DbError;
use crate::record::Rid;
use crate::storage::headers::IndexFileHeader;
use crate::storage::{BufferPoolManager, DiskManager, PageId};

struct TreeState {
    hdr: IndexFileHeader,
}

pub struct BPlusTree {
    pool: Arc<BufferPoolManager>,
    file_id: u32,
    layout: Arc<KeyLayout>,
    state: Mutex<TreeState>,
}

impl BPlusTree {
    /// Creates an empty index file: header page, sentinel leaf-header
    /// page, no root.
    ///
    /// The node order is derived from the page size and key length;
    /// `order_override` may lower it (structural tests use small orders).
    pub fn create(
        disk: &DiskManager,
        path: impl AsRef<std::path::Path>,
        col_types: &[u8],
        col_lens: &[i32],
        order_override: Option<usize>,
    ) -> Result<()> {
        let key_len: i32 = col_lens.iter().sum();
        ensure!(key_len > 0, "index key must be non-empty");
        let derived = (PAGE_SIZE - NODE_HDR_SIZE) / (key_len as usize + 8);
        let order = order_override.map_or(derived, |o| o.min(derived));
        // Order 4 keeps min_size >= 2, so every under-full non-root node
        // has a sibling to rebalance with.
        ensure!(
            order >= 4,
            "key length {} leaves room for only {} entries per node",
            key_len,
            order
        );

        disk.create_file(&path)?;
        let fid = disk.open_file(&path)?;

        let hdr = IndexFileHeader::new(col_types, col_lens, order as i32)?;
        let mut page = vec![0u8; PAGE_SIZE];
        hdr.write_to(&mut page)?;
        disk.write_page(fid, 0, &page)?;

        let mut sentinel = vec![0u8; PAGE_SIZE];
        init_raw_node(
            &mut sentinel,
            true,
            NO_PAGE,
            IX_LEAF_HEADER_PAGE,
            IX_LEAF_HEADER_PAGE,
        );
        disk.write_page(fid, IX_LEAF_HEADER_PAGE, &sentinel)?;
        disk.close_file(fid)?;
        Ok(())
    }

    /// Opens an existing index file and re-seeds the page allocator.
    pub fn open(pool: Arc<BufferPoolManager>, path: impl AsRef<std::path::Path>) -> Result<Self> {
        let disk = Arc::clone(pool.disk());
        let file_id = disk.open_file(&path)?;

        let mut page = vec![0u8; PAGE_SIZE];
        disk.read_page(file_id, 0, &mut page)?;
        let hdr = *IndexFileHeader::from_bytes(&page)?;

        // Freed pages may sit below the high-water mark; never hand out a
        // number that is already materialized in the file.
        let seed = hdr.num_pages().max(disk.file_size_pages(file_id)?);
        disk.set_page_counter(file_id, seed)?;

        let layout = Arc::new(KeyLayout {
            col_types: hdr.col_types(),
            col_lens: hdr.col_lens(),
            key_len: hdr.key_len() as usize,
            order: hdr.order() as usize,
        });
        Ok(Self {
            pool,
            file_id,
            layout,
            state: Mutex::new(TreeState { hdr }),
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn key_len(&self) -> usize {
        self.layout.key_len
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().hdr.root_page() == NO_PAGE
    }

    /// Point lookup: the rid stored under `key`, if present.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<Rid>> {
        ensure!(key.len() == self.layout.key_len, "key length mismatch");
        let st = self.state.lock();
        if st.hdr.root_page() == NO_PAGE {
            return Ok(None);
        }
        let leaf = self.find_leaf(&st.hdr, key)?;
        Ok(leaf.leaf_lookup(key))
    }

    /// Inserts `(key, rid)`. Inserting an already-present key leaves the
    /// tree unchanged.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> Result<()> {
        ensure!(key.len() == self.layout.key_len, "key length mismatch");
        let mut st = self.state.lock();

        if st.hdr.root_page() == NO_PAGE {
            let root = self.create_node(&mut st.hdr)?;
            root.init(true, NO_PAGE, IX_LEAF_HEADER_PAGE, IX_LEAF_HEADER_PAGE);
            root.insert(key, rid);
            let pg = root.page_no();
            st.hdr.set_root_page(pg);
            st.hdr.set_first_leaf(pg);
            st.hdr.set_last_leaf(pg);
            let sentinel = self.fetch_node(IX_LEAF_HEADER_PAGE)?;
            sentinel.set_prev_leaf(pg);
            sentinel.set_next_leaf(pg);
            return Ok(());
        }

        let leaf = self.find_leaf(&st.hdr, key)?;
        let old_size = leaf.size();
        let new_size = leaf.insert(key, rid);
        if new_size == old_size {
            return Ok(());
        }

        if new_size != self.layout.order {
            self.maintain_parent(&leaf)?;
            return Ok(());
        }

        let sibling = self.split(&mut st.hdr, &leaf)?;
        if leaf.page_no() == st.hdr.last_leaf() {
            st.hdr.set_last_leaf(sibling.page_no());
        }
        let separator = sibling.first_key();
        self.insert_into_parent(&mut st.hdr, &leaf, &separator, &sibling)?;
        Ok(())
    }

    /// Deletes `key`. Returns `false` if it was not present.
    pub fn delete_entry(&self, key: &[u8]) -> Result<bool> {
        ensure!(key.len() == self.layout.key_len, "key length mismatch");
        let mut st = self.state.lock();
        if st.hdr.root_page() == NO_PAGE {
            return Ok(false);
        }

        let leaf = self.find_leaf(&st.hdr, key)?;
        let old_size = leaf.size();
        let new_size = leaf.remove(key);
        if new_size == old_size {
            return Ok(false);
        }

        if new_size > 0 {
            self.maintain_parent(&leaf)?;
        }
        if new_size < self.layout.min_size() {
            self.rebalance(&mut st.hdr, leaf)?;
        }
        Ok(true)
    }

    /// Iterator position of the first entry `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iid> {
        ensure!(key.len() == self.layout.key_len, "key length mismatch");
        let st = self.state.lock();
        if st.hdr.root_page() == NO_PAGE {
            return Ok(Iid::new(IX_LEAF_HEADER_PAGE, 0));
        }
        let leaf = self.find_leaf(&st.hdr, key)?;
        let pos = leaf.lower_bound(key);
        self.position(&st.hdr, &leaf, pos)
    }

    /// Iterator position one past the last entry `<= key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iid> {
        ensure!(key.len() == self.layout.key_len, "key length mismatch");
        let st = self.state.lock();
        if st.hdr.root_page() == NO_PAGE {
            return Ok(Iid::new(IX_LEAF_HEADER_PAGE, 0));
        }
        let leaf = self.find_leaf(&st.hdr, key)?;
        let pos = leaf.upper_bound(key);
        self.position(&st.hdr, &leaf, pos)
    }

    /// Position of the first entry in the tree.
    pub fn leaf_begin(&self) -> Result<Iid> {
        let st = self.state.lock();
        Ok(Iid::new(st.hdr.first_leaf(), 0))
    }

    /// Position one past the last entry in the tree.
    pub fn leaf_end(&self) -> Result<Iid> {
        let st = self.state.lock();
        if st.hdr.root_page() == NO_PAGE {
            return Ok(Iid::new(IX_LEAF_HEADER_PAGE, 0));
        }
        let last = self.fetch_node(st.hdr.last_leaf())?;
        Ok(Iid::new(last.page_no(), last.size() as i32))
    }

    /// Resolves an iterator position to the rid it stores.
    pub fn get_rid(&self, iid: Iid) -> Result<Rid> {
        let node = self.fetch_node(iid.page_no)?;
        if iid.slot_no < 0 || iid.slot_no as usize >= node.size() {
            return Err(DbError::IndexEntryNotFound.into());
        }
        Ok(node.rid_at(iid.slot_no as usize))
    }

    /// Flushes all cached pages and the file header to disk.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all_pages(self.file_id)?;
        let st = self.state.lock();
        let mut page = vec![0u8; PAGE_SIZE];
        st.hdr.write_to(&mut page)?;
        self.pool.disk().write_page(self.file_id, 0, &page)?;
        self.pool.disk().sync_file(self.file_id)?;
        Ok(())
    }

    /// Flushes and unregisters the underlying file.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.pool.disk().close_file(self.file_id)
    }

    pub(crate) fn fetch_node(&self, page_no: i32) -> Result<Node<'_>> {
        ensure!(
            page_no > 0,
            DbError::PageNotExist {
                file_id: self.file_id,
                page_no
            }
        );
        let guard = self.pool.fetch_page(PageId::new(self.file_id, page_no))?;
        Ok(Node::new(guard, Arc::clone(&self.layout)))
    }

    fn create_node(&self, hdr: &mut IndexFileHeader) -> Result<Node<'_>> {
        hdr.set_num_pages(hdr.num_pages() + 1);
        let guard = self.pool.new_page(self.file_id)?;
        Ok(Node::new(guard, Arc::clone(&self.layout)))
    }

    /// Drops the node's pin and releases its frame. The page number is
    /// not reused within the file.
    fn free_node(&self, hdr: &mut IndexFileHeader, node: Node<'_>) -> Result<()> {
        hdr.set_num_pages(hdr.num_pages() - 1);
        let page_id = PageId::new(self.file_id, node.page_no());
        drop(node);
        self.pool.delete_page(page_id)?;
        Ok(())
    }

    /// Descends from the root to the leaf that could hold `key`.
    fn find_leaf(&self, hdr: &IndexFileHeader, key: &[u8]) -> Result<Node<'_>> {
        let mut node = self.fetch_node(hdr.root_page())?;
        while !node.is_leaf() {
            let child = node.internal_lookup(key);
            node = self.fetch_node(child)?;
        }
        Ok(node)
    }

    /// Splits `node`, moving its right half into a freshly allocated
    /// sibling. Leaf splits splice the sibling into the leaf chain; the
    /// successor's back-pointer update covers the sentinel uniformly.
    fn split<'a>(&'a self, hdr: &mut IndexFileHeader, node: &Node<'a>) -> Result<Node<'a>> {
        let sibling = self.create_node(hdr)?;
        sibling.init(node.is_leaf(), node.parent(), NO_PAGE, NO_PAGE);

        let total = node.size();
        let split_point = total / 2;
        let keys = node.keys_between(split_point, total);
        let rids = node.rids_between(split_point, total);
        sibling.insert_pairs(0, &keys, &rids);
        node.set_size(split_point);

        if sibling.is_leaf() {
            sibling.set_next_leaf(node.next_leaf());
            sibling.set_prev_leaf(node.page_no());
            node.set_next_leaf(sibling.page_no());
            let successor = self.fetch_node(sibling.next_leaf())?;
            successor.set_prev_leaf(sibling.page_no());
        } else {
            for i in 0..sibling.size() {
                self.maintain_child(&sibling, i)?;
            }
        }
        Ok(sibling)
    }

    /// Publishes a split to the parent, growing a new root when the split
    /// node was the root and recursing when the parent overflows.
    fn insert_into_parent(
        &self,
        hdr: &mut IndexFileHeader,
        old_node: &Node<'_>,
        key: &[u8],
        new_node: &Node<'_>,
    ) -> Result<()> {
        if old_node.parent() == NO_PAGE {
            let root = self.create_node(hdr)?;
            root.init(false, NO_PAGE, NO_PAGE, NO_PAGE);
            root.insert_pairs(0, &old_node.first_key(), &[Rid::new(old_node.page_no(), NO_SLOT)]);
            root.insert_pairs(1, key, &[Rid::new(new_node.page_no(), NO_SLOT)]);
            old_node.set_parent(root.page_no());
            new_node.set_parent(root.page_no());
            hdr.set_root_page(root.page_no());
            return Ok(());
        }

        let parent = self.fetch_node(old_node.parent())?;
        parent.insert(key, Rid::new(new_node.page_no(), NO_SLOT));
        new_node.set_parent(parent.page_no());
        self.maintain_parent(old_node)?;

        if parent.size() == self.layout.order {
            let new_parent = self.split(hdr, &parent)?;
            let separator = new_parent.first_key();
            self.insert_into_parent(hdr, &parent, &separator, &new_parent)?;
        }
        Ok(())
    }

    /// Restores the under-full `node` after a delete: redistribute from a
    /// sibling when their combined size allows it, merge otherwise. The
    /// root is handled by `adjust_root`.
    fn rebalance(&self, hdr: &mut IndexFileHeader, node: Node<'_>) -> Result<()> {
        if node.page_no() == hdr.root_page() {
            return self.adjust_root(hdr, node);
        }
        if node.size() >= self.layout.min_size() {
            return Ok(());
        }

        let parent = self.fetch_node(node.parent())?;
        let node_idx = parent.find_child(node.page_no()).ok_or_else(|| {
            DbError::Internal(format!(
                "node {} missing from parent {}",
                node.page_no(),
                parent.page_no()
            ))
        })?;
        // Prefer the left sibling; the leftmost child pairs with its right.
        let neighbor_idx = if node_idx == 0 { 1 } else { node_idx - 1 };
        let neighbor = self.fetch_node(parent.child_at(neighbor_idx))?;

        if node.size() + neighbor.size() >= 2 * self.layout.min_size() {
            self.redistribute(&neighbor, &node, node_idx)?;
            self.maintain_parent(&neighbor)?;
            self.maintain_parent(&node)?;
            return Ok(());
        }

        // Merge: make sure the survivor is the left party.
        let (left, right, erase_idx) = if node_idx == 0 {
            (node, neighbor, 1)
        } else {
            (neighbor, node, node_idx)
        };

        let left_size = left.size();
        let right_size = right.size();
        let keys = right.keys_between(0, right_size);
        let rids = right.rids_between(0, right_size);
        left.insert_pairs(left_size, &keys, &rids);
        if !left.is_leaf() {
            for i in left_size..left_size + right_size {
                self.maintain_child(&left, i)?;
            }
        }

        if left.is_leaf() {
            left.set_next_leaf(right.next_leaf());
            let successor = self.fetch_node(right.next_leaf())?;
            successor.set_prev_leaf(left.page_no());
            if right.page_no() == hdr.first_leaf() {
                hdr.set_first_leaf(left.page_no());
            }
            if right.page_no() == hdr.last_leaf() {
                hdr.set_last_leaf(left.page_no());
            }
        }

        parent.erase_pair(erase_idx);
        self.free_node(hdr, right)?;
        self.maintain_parent(&left)?;

        // The parent may now be under-full (or a shrunken root).
        self.rebalance(hdr, parent)
    }

    /// Moves one entry across the near edges of `neighbor` and `node`.
    /// `node_idx == 0` means the neighbor is the right sibling.
    fn redistribute(&self, neighbor: &Node<'_>, node: &Node<'_>, node_idx: usize) -> Result<()> {
        if node_idx == 0 {
            let key = neighbor.key_at(0);
            let rid = neighbor.rid_at(0);
            node.insert_pairs(node.size(), &key, &[rid]);
            neighbor.erase_pair(0);
            if !node.is_leaf() {
                self.maintain_child(node, node.size() - 1)?;
            }
        } else {
            let last = neighbor.size() - 1;
            let key = neighbor.key_at(last);
            let rid = neighbor.rid_at(last);
            node.insert_pairs(0, &key, &[rid]);
            neighbor.erase_pair(last);
            if !node.is_leaf() {
                self.maintain_child(node, 0)?;
            }
        }
        Ok(())
    }

    /// Root-specific rebalancing: an internal root with a single child is
    /// replaced by that child; an emptied leaf root clears the tree.
    fn adjust_root(&self, hdr: &mut IndexFileHeader, old_root: Node<'_>) -> Result<()> {
        if !old_root.is_leaf() && old_root.size() == 1 {
            let child_page = old_root.child_at(0);
            let child = self.fetch_node(child_page)?;
            child.set_parent(NO_PAGE);
            hdr.set_root_page(child_page);
            self.free_node(hdr, old_root)?;
            return Ok(());
        }
        if old_root.is_leaf() && old_root.size() == 0 {
            hdr.set_root_page(NO_PAGE);
            hdr.set_first_leaf(IX_LEAF_HEADER_PAGE);
            hdr.set_last_leaf(IX_LEAF_HEADER_PAGE);
            let sentinel = self.fetch_node(IX_LEAF_HEADER_PAGE)?;
            sentinel.set_prev_leaf(IX_LEAF_HEADER_PAGE);
            sentinel.set_next_leaf(IX_LEAF_HEADER_PAGE);
            drop(sentinel);
            self.free_node(hdr, old_root)?;
        }
        Ok(())
    }

    /// Walks ancestors, overwriting each stored separator that no longer
    /// equals its child's first key. Stops at the first match.
    fn maintain_parent(&self, node: &Node<'_>) -> Result<()> {
        let mut curr_page = node.page_no();
        let mut curr_key = node.first_key();
        let mut parent_no = node.parent();

        while parent_no != NO_PAGE {
            let parent = self.fetch_node(parent_no)?;
            let rank = parent.find_child(curr_page).ok_or_else(|| {
                DbError::Internal(format!(
                    "node {} missing from parent {}",
                    curr_page, parent_no
                ))
            })?;
            if parent.key_at(rank) == curr_key {
                break;
            }
            parent.set_key_at(rank, &curr_key);
            curr_page = parent.page_no();
            curr_key = parent.first_key();
            parent_no = parent.parent();
        }
        Ok(())
    }

    /// Points the `child_idx`-th child's parent back-pointer at `node`.
    fn maintain_child(&self, node: &Node<'_>, child_idx: usize) -> Result<()> {
        if !node.is_leaf() {
            let child = self.fetch_node(node.child_at(child_idx))?;
            child.set_parent(node.page_no());
        }
        Ok(())
    }

    /// Converts a leaf-local slot (possibly `== size`) into a proper
    /// iterator position, hopping to the next leaf or the global end.
    fn position(&self, hdr: &IndexFileHeader, leaf: &Node<'_>, pos: usize) -> Result<Iid> {
        if pos < leaf.size() || leaf.page_no() == hdr.last_leaf() {
            return Ok(Iid::new(leaf.page_no(), pos as i32));
        }
        Ok(Iid::new(leaf.next_leaf(), 0))
    }
}
