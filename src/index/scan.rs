//! Range scan over the B+tree leaf chain.
//!
//! An [`IndexScan`] is constructed from two iterator positions (usually
//! the tree's `lower_bound` and `upper_bound` of a range) and yields rids
//! in ascending key order by walking `next_leaf` links. It terminates
//! when the position reaches the upper bound or the chain runs out at the
//! sentinel.

use std::sync::Arc;

use eyre::Result;

use super::{BPlusTree, Iid};
use crate::config::IX_LEAF_HEADER_PAGE;
use crate::record::Rid;

pub struct IndexScan {
    tree: Arc<BPlusTree>,
    iid: Iid,
    end: Iid,
}

impl IndexScan {
    pub fn new(tree: Arc<BPlusTree>, lower: Iid, upper: Iid) -> Self {
        Self {
            tree,
            iid: lower,
            end: upper,
        }
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end || self.iid.page_no == IX_LEAF_HEADER_PAGE
    }

    /// Rid stored at the current position.
    pub fn rid(&self) -> Result<Rid> {
        self.tree.get_rid(self.iid)
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    /// Advances one slot, hopping to the next leaf when the current one
    /// is exhausted.
    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        let node = self.tree.fetch_node(self.iid.page_no)?;
        self.iid.slot_no += 1;
        if self.iid.slot_no as usize >= node.size() && self.iid.page_no != self.end.page_no {
            self.iid = Iid::new(node.next_leaf(), 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TAG_INT;
    use crate::storage::{BufferPoolManager, DiskManager};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn int_key(v: i32) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    fn tree_with(values: &[i32], order: usize) -> (tempfile::TempDir, Arc<BPlusTree>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.idx");
        let disk = Arc::new(DiskManager::new());
        BPlusTree::create(&disk, &path, &[TAG_INT], &[4], Some(order)).unwrap();
        let pool = Arc::new(BufferPoolManager::new(disk, 64));
        let tree = BPlusTree::open(pool, &path).unwrap();
        for &v in values {
            tree.insert_entry(&int_key(v), Rid::new(1, v)).unwrap();
        }
        (dir, Arc::new(tree))
    }

    fn scan_all(tree: &Arc<BPlusTree>, lower: Iid, upper: Iid) -> Vec<i32> {
        let mut scan = IndexScan::new(Arc::clone(tree), lower, upper);
        let mut out = Vec::new();
        while !scan.is_end() {
            out.push(scan.rid().unwrap().slot_no);
            scan.next().unwrap();
        }
        out
    }

    #[test]
    fn full_scan_equals_sorted_input() {
        let values: Vec<i32> = (0..80).map(|v| (v * 53) % 80).collect();
        let (_dir, tree) = tree_with(&values, 4);
        let got = scan_all(&tree, tree.leaf_begin().unwrap(), tree.leaf_end().unwrap());
        assert_eq!(got, (0..80).collect::<Vec<_>>());
    }

    #[test]
    fn range_scan_is_inclusive_of_bounds() {
        let (_dir, tree) = tree_with(&[5, 1, 3, 7, 2, 4, 6], 4);
        let lower = tree.lower_bound(&int_key(2)).unwrap();
        let upper = tree.upper_bound(&int_key(6)).unwrap();
        assert_eq!(scan_all(&tree, lower, upper), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn empty_tree_scan_terminates_immediately() {
        let (_dir, tree) = tree_with(&[], 4);
        let got = scan_all(&tree, tree.leaf_begin().unwrap(), tree.leaf_end().unwrap());
        assert!(got.is_empty());
    }

    #[test]
    fn point_range_on_missing_key_is_empty() {
        let (_dir, tree) = tree_with(&[10, 20, 30], 4);
        let lower = tree.lower_bound(&int_key(15)).unwrap();
        let upper = tree.upper_bound(&int_key(15)).unwrap();
        assert_eq!(scan_all(&tree, lower, upper), Vec::<i32>::new());
    }
}
