//! # Node Page Layout and Accessors
//!
//! One B+tree node occupies one page. Internal and leaf nodes share the
//! layout; only the interpretation of the rid slots differs (leaf: tuple
//! rid, internal: `page_no` = child, `slot_no` = -1).
//!
//! ```text
//! Offset                Size              Field
//! 0                     20                node header
//! 20                    order · key_len   key slots
//! 20 + order · key_len  order · 8         rid slots
//! ```
//!
//! [`Node`] owns the pinned page guard; reads copy small values out and
//! writes go through the guard's write lock, which marks the frame dirty.
//! Dropping the node releases the pin.

use std::cmp::Ordering;
use std::sync::Arc;

use zerocopy::little_endian::I32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{compare_keys, KeyLayout};
use crate::record::Rid;
use crate::storage::PageGuard;

pub(crate) const NODE_HDR_SIZE: usize = 20;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    is_leaf: u8,
    _pad: [u8; 3],
    num_key: I32,
    parent: I32,
    prev_leaf: I32,
    next_leaf: I32,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HDR_SIZE);

const DISK_RID_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DiskRid {
    page_no: I32,
    slot_no: I32,
}

/// Initializes raw page bytes as an empty node, for writing node pages
/// outside the buffer pool (file creation).
pub(crate) fn init_raw_node(data: &mut [u8], is_leaf: bool, parent: i32, prev: i32, next: i32) {
    let hdr = NodeHeader::mut_from_bytes(&mut data[..NODE_HDR_SIZE])
        .expect("node header layout is const-asserted");
    hdr.is_leaf = is_leaf as u8;
    hdr._pad = [0u8; 3];
    hdr.num_key = I32::new(0);
    hdr.parent = I32::new(parent);
    hdr.prev_leaf = I32::new(prev);
    hdr.next_leaf = I32::new(next);
}

/// A pinned B+tree node.
pub(crate) struct Node<'a> {
    guard: PageGuard<'a>,
    page_no: i32,
    layout: Arc<KeyLayout>,
}

impl<'a> Node<'a> {
    pub fn new(guard: PageGuard<'a>, layout: Arc<KeyLayout>) -> Self {
        let page_no = guard.page_id().page_no;
        Self {
            guard,
            page_no,
            layout,
        }
    }

    /// Initializes a freshly allocated (zeroed) page as an empty node.
    pub fn init(&self, is_leaf: bool, parent: i32, prev_leaf: i32, next_leaf: i32) {
        let mut data = self.guard.write();
        let hdr = Self::hdr_mut(&mut data[..]);
        hdr.is_leaf = is_leaf as u8;
        hdr.num_key = I32::new(0);
        hdr.parent = I32::new(parent);
        hdr.prev_leaf = I32::new(prev_leaf);
        hdr.next_leaf = I32::new(next_leaf);
    }

    pub fn page_no(&self) -> i32 {
        self.page_no
    }

    pub fn is_leaf(&self) -> bool {
        self.with_hdr(|h| h.is_leaf != 0)
    }

    pub fn set_is_leaf(&self, is_leaf: bool) {
        let mut data = self.guard.write();
        Self::hdr_mut(&mut data[..]).is_leaf = is_leaf as u8;
    }

    pub fn size(&self) -> usize {
        self.with_hdr(|h| h.num_key.get() as usize)
    }

    pub fn set_size(&self, size: usize) {
        let mut data = self.guard.write();
        Self::hdr_mut(&mut data[..]).num_key = I32::new(size as i32);
    }

    pub fn parent(&self) -> i32 {
        self.with_hdr(|h| h.parent.get())
    }

    pub fn set_parent(&self, page_no: i32) {
        let mut data = self.guard.write();
        Self::hdr_mut(&mut data[..]).parent = I32::new(page_no);
    }

    pub fn prev_leaf(&self) -> i32 {
        self.with_hdr(|h| h.prev_leaf.get())
    }

    pub fn set_prev_leaf(&self, page_no: i32) {
        let mut data = self.guard.write();
        Self::hdr_mut(&mut data[..]).prev_leaf = I32::new(page_no);
    }

    pub fn next_leaf(&self) -> i32 {
        self.with_hdr(|h| h.next_leaf.get())
    }

    pub fn set_next_leaf(&self, page_no: i32) {
        let mut data = self.guard.write();
        Self::hdr_mut(&mut data[..]).next_leaf = I32::new(page_no);
    }

    pub fn key_at(&self, pos: usize) -> Vec<u8> {
        let data = self.guard.read();
        data[self.key_range(pos)].to_vec()
    }

    pub fn first_key(&self) -> Vec<u8> {
        self.key_at(0)
    }

    pub fn set_key_at(&self, pos: usize, key: &[u8]) {
        let range = self.key_range(pos);
        let mut data = self.guard.write();
        data[range].copy_from_slice(key);
    }

    pub fn rid_at(&self, pos: usize) -> Rid {
        let data = self.guard.read();
        let raw = DiskRid::ref_from_bytes(&data[self.rid_range(pos)])
            .expect("rid slot layout is const-asserted");
        Rid::new(raw.page_no.get(), raw.slot_no.get())
    }

    /// Child page number stored at `pos` (internal nodes).
    pub fn child_at(&self, pos: usize) -> i32 {
        self.rid_at(pos).page_no
    }

    /// First slot in `[0, size]` whose key is `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.search(key, |ord| ord == Ordering::Less)
    }

    /// First slot in `[0, size]` whose key is `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.search(key, |ord| ord != Ordering::Greater)
    }

    /// Rid stored under `key`, if the leaf holds it.
    pub fn leaf_lookup(&self, key: &[u8]) -> Option<Rid> {
        let pos = self.lower_bound(key);
        if pos < self.size() && self.key_equals(pos, key) {
            Some(self.rid_at(pos))
        } else {
            None
        }
    }

    /// Child whose subtree could contain `key` (internal nodes).
    pub fn internal_lookup(&self, key: &[u8]) -> i32 {
        let mut pos = self.upper_bound(key);
        if pos > 0 {
            pos -= 1;
        }
        self.child_at(pos)
    }

    /// Slot whose rid points at `child_page` (internal nodes).
    pub fn find_child(&self, child_page: i32) -> Option<usize> {
        (0..self.size()).find(|&i| self.child_at(i) == child_page)
    }

    /// Inserts `n` consecutive pairs at `pos`, shifting the tail right.
    /// `keys` holds `n · key_len` bytes; `rids` holds `n` entries.
    pub fn insert_pairs(&self, pos: usize, keys: &[u8], rids: &[Rid]) {
        let kl = self.layout.key_len;
        let n = rids.len();
        debug_assert_eq!(keys.len(), n * kl);
        let size = self.size();
        debug_assert!(pos <= size);
        debug_assert!(size + n <= self.layout.order);

        let keys_base = NODE_HDR_SIZE;
        let rids_base = NODE_HDR_SIZE + self.layout.order * kl;

        let mut data = self.guard.write();
        if pos < size {
            let src = keys_base + pos * kl;
            data.copy_within(src..keys_base + size * kl, src + n * kl);
            let src = rids_base + pos * DISK_RID_SIZE;
            data.copy_within(
                src..rids_base + size * DISK_RID_SIZE,
                src + n * DISK_RID_SIZE,
            );
        }
        data[keys_base + pos * kl..keys_base + (pos + n) * kl].copy_from_slice(keys);
        for (i, rid) in rids.iter().enumerate() {
            let raw = DiskRid {
                page_no: I32::new(rid.page_no),
                slot_no: I32::new(rid.slot_no),
            };
            let off = rids_base + (pos + i) * DISK_RID_SIZE;
            data[off..off + DISK_RID_SIZE].copy_from_slice(raw.as_bytes());
        }
        let hdr = Self::hdr_mut(&mut data[..]);
        hdr.num_key = I32::new((size + n) as i32);
    }

    /// Sorted single-pair insert. Duplicate keys are ignored. Returns the
    /// node size after the operation.
    pub fn insert(&self, key: &[u8], rid: Rid) -> usize {
        let pos = self.lower_bound(key);
        if pos < self.size() && self.key_equals(pos, key) {
            return self.size();
        }
        self.insert_pairs(pos, key, &[rid]);
        self.size()
    }

    /// Removes the pair at `pos`, shifting the tail left.
    pub fn erase_pair(&self, pos: usize) {
        let kl = self.layout.key_len;
        let size = self.size();
        debug_assert!(pos < size);

        let keys_base = NODE_HDR_SIZE;
        let rids_base = NODE_HDR_SIZE + self.layout.order * kl;

        let mut data = self.guard.write();
        if pos + 1 < size {
            let dst = keys_base + pos * kl;
            data.copy_within(keys_base + (pos + 1) * kl..keys_base + size * kl, dst);
            let dst = rids_base + pos * DISK_RID_SIZE;
            data.copy_within(
                rids_base + (pos + 1) * DISK_RID_SIZE..rids_base + size * DISK_RID_SIZE,
                dst,
            );
        }
        let hdr = Self::hdr_mut(&mut data[..]);
        hdr.num_key = I32::new((size - 1) as i32);
    }

    /// Removes `key` if present. Returns the node size after the
    /// operation.
    pub fn remove(&self, key: &[u8]) -> usize {
        let pos = self.lower_bound(key);
        if pos < self.size() && self.key_equals(pos, key) {
            self.erase_pair(pos);
        }
        self.size()
    }

    /// Contiguous copy of keys in `[from, to)` for bulk moves.
    pub fn keys_between(&self, from: usize, to: usize) -> Vec<u8> {
        let kl = self.layout.key_len;
        let data = self.guard.read();
        data[NODE_HDR_SIZE + from * kl..NODE_HDR_SIZE + to * kl].to_vec()
    }

    /// Copy of rids in `[from, to)`.
    pub fn rids_between(&self, from: usize, to: usize) -> Vec<Rid> {
        (from..to).map(|i| self.rid_at(i)).collect()
    }

    fn key_equals(&self, pos: usize, key: &[u8]) -> bool {
        let data = self.guard.read();
        compare_keys(
            &data[self.key_range(pos)],
            key,
            &self.layout.col_types,
            &self.layout.col_lens,
        ) == Ordering::Equal
    }

    /// Binary search returning the first slot for which `descend_right`
    /// is false, i.e. the partition point of the predicate.
    fn search(&self, key: &[u8], descend_right: impl Fn(Ordering) -> bool) -> usize {
        let data = self.guard.read();
        let (mut left, mut right) = (0usize, self.size_of(&data[..]));
        while left < right {
            let mid = left + (right - left) / 2;
            let ord = compare_keys(
                &data[self.key_range(mid)],
                key,
                &self.layout.col_types,
                &self.layout.col_lens,
            );
            if descend_right(ord) {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left
    }

    fn size_of(&self, data: &[u8]) -> usize {
        NodeHeader::ref_from_bytes(&data[..NODE_HDR_SIZE])
            .expect("node header layout is const-asserted")
            .num_key
            .get() as usize
    }

    fn key_range(&self, pos: usize) -> std::ops::Range<usize> {
        let kl = self.layout.key_len;
        let base = NODE_HDR_SIZE + pos * kl;
        base..base + kl
    }

    fn rid_range(&self, pos: usize) -> std::ops::Range<usize> {
        let base = NODE_HDR_SIZE + self.layout.order * self.layout.key_len + pos * DISK_RID_SIZE;
        base..base + DISK_RID_SIZE
    }

    fn with_hdr<R>(&self, f: impl FnOnce(&NodeHeader) -> R) -> R {
        let data = self.guard.read();
        f(NodeHeader::ref_from_bytes(&data[..NODE_HDR_SIZE])
            .expect("node header layout is const-asserted"))
    }

    fn hdr_mut(data: &mut [u8]) -> &mut NodeHeader {
        NodeHeader::mut_from_bytes(&mut data[..NODE_HDR_SIZE])
            .expect("node header layout is const-asserted")
    }
}
