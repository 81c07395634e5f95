//! Index scan: range access through a B+tree.
//!
//! The key range is extracted from the scan conditions. Equality
//! conditions on the index columns build a probe key (unconstrained
//! suffix columns stay zero); on a single-column index, range operators
//! on the column tighten the bounds instead. Conditions that do not
//! contribute to the bounds are still evaluated against every candidate
//! tuple, so the executor's output is exact regardless of how much of
//! the predicate the index absorbed.

use std::sync::Arc;

use eyre::Result;

use super::{eval_conds, CompOp, Condition, Executor, RhsOperand};
use crate::catalog::{ColMeta, IndexMeta, Value};
use crate::errors::DbError;
use crate::index::{BPlusTree, Iid, IndexScan};
use crate::record::{Record, RecordFileHandle, Rid};
use crate::system::SystemManager;
use crate::txn::{Context, LockMode};

pub struct IndexScanExecutor {
    fh: Arc<RecordFileHandle>,
    tree: Arc<BPlusTree>,
    index: IndexMeta,
    schema: Vec<ColMeta>,
    conds: Vec<Condition>,
    ctx: Option<Context>,
    scan: Option<IndexScan>,
    rid: Rid,
}

impl IndexScanExecutor {
    pub fn new(
        sys: &SystemManager,
        table: &str,
        conds: Vec<Condition>,
        index_cols: &[String],
        ctx: Option<Context>,
    ) -> Result<Self> {
        let meta = sys.table_meta(table)?;
        let index = meta
            .get_index_meta(index_cols)
            .cloned()
            .ok_or_else(|| DbError::IndexNotFound(format!("{}({})", table, index_cols.join(","))))?;
        let tree = sys
            .index_handle(table, index_cols)
            .ok_or_else(|| DbError::IndexNotFound(index.name()))?;
        let fh = sys.table_file(table)?;
        Ok(Self {
            fh,
            tree,
            index,
            schema: meta.cols,
            conds,
            ctx,
            scan: None,
            rid: Rid::invalid(),
        })
    }

    /// Literal condition on `col` with operator in `ops`, if any.
    fn literal_cond(&self, col: &str, ops: &[CompOp]) -> Option<(&Value, CompOp)> {
        self.conds.iter().find_map(|c| {
            if c.lhs_col != col || !ops.contains(&c.op) {
                return None;
            }
            match &c.rhs {
                RhsOperand::Value(v) => Some((v, c.op)),
                RhsOperand::Col(_) => None,
            }
        })
    }

    /// Computes the `[lower, upper)` iterator range for this scan.
    fn key_range(&self) -> Result<(Iid, Iid)> {
        // Equality probe across the index prefix.
        let mut eq_key = Vec::with_capacity(self.index.col_tot_len);
        let mut eq_cols = 0usize;
        for col in &self.index.cols {
            match self.literal_cond(&col.name, &[CompOp::Eq]) {
                Some((v, _)) => {
                    eq_key.extend_from_slice(&v.to_raw(col)?);
                    eq_cols += 1;
                }
                None => break,
            }
        }

        if eq_cols == self.index.cols.len() {
            let lower = self.tree.lower_bound(&eq_key)?;
            let upper = self.tree.upper_bound(&eq_key)?;
            return Ok((lower, upper));
        }

        // Single-column index: range operators tighten both ends.
        if self.index.cols.len() == 1 {
            let col = &self.index.cols[0];
            let lower = match self.literal_cond(&col.name, &[CompOp::Ge, CompOp::Gt]) {
                Some((v, CompOp::Ge)) => self.tree.lower_bound(&v.to_raw(col)?)?,
                Some((v, _)) => self.tree.upper_bound(&v.to_raw(col)?)?,
                None => self.tree.leaf_begin()?,
            };
            let upper = match self.literal_cond(&col.name, &[CompOp::Le, CompOp::Lt]) {
                Some((v, CompOp::Le)) => self.tree.upper_bound(&v.to_raw(col)?)?,
                Some((v, _)) => self.tree.lower_bound(&v.to_raw(col)?)?,
                None => self.tree.leaf_end()?,
            };
            return Ok((lower, upper));
        }

        // Partial-prefix equality: zero-fill the suffix for the probe's
        // low end and scan to the end of the tree; residual predicate
        // evaluation filters the tail.
        let mut lower_key = eq_key;
        lower_key.resize(self.index.col_tot_len, 0);
        Ok((self.tree.lower_bound(&lower_key)?, self.tree.leaf_end()?))
    }

    fn seek_match(&mut self) -> Result<()> {
        loop {
            let scan = self.scan.as_mut().expect("seek before begin");
            if scan.is_end() {
                self.rid = Rid::invalid();
                return Ok(());
            }
            let rid = scan.rid()?;
            let rec = self.fh.get_record(rid, self.ctx.as_ref())?;
            if eval_conds(&self.schema, &self.conds, rec.data())? {
                self.rid = rid;
                return Ok(());
            }
            self.scan.as_mut().expect("seek before begin").next()?;
        }
    }
}

impl Executor for IndexScanExecutor {
    fn begin(&mut self) -> Result<()> {
        if let Some(ctx) = &self.ctx {
            ctx.lock_table(self.fh.file_id(), LockMode::Shared)?;
        }
        let (lower, upper) = self.key_range()?;
        self.scan = Some(IndexScan::new(Arc::clone(&self.tree), lower, upper));
        self.seek_match()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(scan) = self.scan.as_mut() {
            if !scan.is_end() {
                scan.next()?;
            }
            self.seek_match()?;
        }
        Ok(())
    }

    fn current(&self) -> Result<Option<Record>> {
        if self.is_end() {
            return Ok(None);
        }
        Ok(Some(self.fh.get_record(self.rid, self.ctx.as_ref())?))
    }

    fn current_rid(&self) -> Rid {
        self.rid
    }

    fn is_end(&self) -> bool {
        !self.rid.is_valid()
    }

    fn schema(&self) -> &[ColMeta] {
        &self.schema
    }
}
