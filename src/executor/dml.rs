//! Write executors: insert, update, delete.
//!
//! All three route record mutations through the transactional context —
//! the record file acquires the IX/X locks and appends the undo-log
//! entries — and maintain every index of the table around the record
//! change. `begin` performs the whole mutation; the cursor is empty
//! afterwards.

use std::sync::Arc;

use eyre::Result;

use super::Executor;
use crate::catalog::{ColMeta, TableMeta, Value};
use crate::errors::DbError;
use crate::record::{Record, RecordFileHandle, Rid};
use crate::system::SystemManager;
use crate::txn::Context;

/// One `col = value` assignment of an update.
#[derive(Debug, Clone)]
pub struct SetClause {
    pub col: String,
    pub value: Value,
}

pub struct InsertExecutor {
    sys: Arc<SystemManager>,
    table: TableMeta,
    fh: Arc<RecordFileHandle>,
    values: Vec<Value>,
    ctx: Context,
    rid: Rid,
}

impl std::fmt::Debug for InsertExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertExecutor").finish_non_exhaustive()
    }
}

impl InsertExecutor {
    pub fn new(
        sys: Arc<SystemManager>,
        table: &str,
        values: Vec<Value>,
        ctx: Context,
    ) -> Result<Self> {
        let table = sys.table_meta(table)?;
        if values.len() != table.cols.len() {
            return Err(DbError::InvalidValueCount {
                expected: table.cols.len(),
                actual: values.len(),
            }
            .into());
        }
        let fh = sys.table_file(&table.name)?;
        Ok(Self {
            sys,
            table,
            fh,
            values,
            ctx,
            rid: Rid::invalid(),
        })
    }

    /// Rid of the inserted tuple, valid after `begin`.
    pub fn inserted_rid(&self) -> Rid {
        self.rid
    }
}

impl Executor for InsertExecutor {
    fn begin(&mut self) -> Result<()> {
        let mut rec = vec![0u8; self.table.record_size()];
        for (col, value) in self.table.cols.iter().zip(&self.values) {
            rec[col.offset..col.offset + col.len].copy_from_slice(&value.to_raw(col)?);
        }

        self.rid = self.fh.insert_record(&rec, Some(&self.ctx))?;

        for index in &self.table.indexes {
            if let Some(ih) = self.sys.index_handle(&self.table.name, &index.col_names()) {
                ih.insert_entry(&index.key_from_tuple(&rec), self.rid)?;
            }
        }
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        Ok(())
    }

    fn current(&self) -> Result<Option<Record>> {
        Ok(None)
    }

    fn current_rid(&self) -> Rid {
        self.rid
    }

    fn is_end(&self) -> bool {
        true
    }

    fn schema(&self) -> &[ColMeta] {
        &[]
    }
}

pub struct DeleteExecutor {
    sys: Arc<SystemManager>,
    table: TableMeta,
    fh: Arc<RecordFileHandle>,
    rids: Vec<Rid>,
    ctx: Context,
}

impl DeleteExecutor {
    pub fn new(
        sys: Arc<SystemManager>,
        table: &str,
        rids: Vec<Rid>,
        ctx: Context,
    ) -> Result<Self> {
        let table = sys.table_meta(table)?;
        let fh = sys.table_file(&table.name)?;
        Ok(Self {
            sys,
            table,
            fh,
            rids,
            ctx,
        })
    }
}

impl Executor for DeleteExecutor {
    fn begin(&mut self) -> Result<()> {
        for &rid in &self.rids {
            let old = self.fh.get_record(rid, Some(&self.ctx))?;

            for index in &self.table.indexes {
                if let Some(ih) = self.sys.index_handle(&self.table.name, &index.col_names()) {
                    ih.delete_entry(&index.key_from_tuple(old.data()))?;
                }
            }
            self.fh.delete_record(rid, Some(&self.ctx))?;
        }
        self.rids.clear();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        Ok(())
    }

    fn current(&self) -> Result<Option<Record>> {
        Ok(None)
    }

    fn current_rid(&self) -> Rid {
        Rid::invalid()
    }

    fn is_end(&self) -> bool {
        true
    }

    fn schema(&self) -> &[ColMeta] {
        &[]
    }
}

pub struct UpdateExecutor {
    sys: Arc<SystemManager>,
    table: TableMeta,
    fh: Arc<RecordFileHandle>,
    rids: Vec<Rid>,
    set_clauses: Vec<SetClause>,
    ctx: Context,
}

impl UpdateExecutor {
    pub fn new(
        sys: Arc<SystemManager>,
        table: &str,
        set_clauses: Vec<SetClause>,
        rids: Vec<Rid>,
        ctx: Context,
    ) -> Result<Self> {
        let table = sys.table_meta(table)?;
        let fh = sys.table_file(&table.name)?;
        Ok(Self {
            sys,
            table,
            fh,
            rids,
            set_clauses,
            ctx,
        })
    }

    /// Whether any assigned column participates in `index`.
    fn index_touched(&self, index_cols: &[ColMeta]) -> bool {
        self.set_clauses
            .iter()
            .any(|sc| index_cols.iter().any(|c| c.name == sc.col))
    }
}

impl Executor for UpdateExecutor {
    fn begin(&mut self) -> Result<()> {
        for &rid in &self.rids {
            let old = self.fh.get_record(rid, Some(&self.ctx))?;

            let mut new_rec = old.data().to_vec();
            for sc in &self.set_clauses {
                let col = self
                    .table
                    .cols
                    .iter()
                    .find(|c| c.name == sc.col)
                    .ok_or_else(|| {
                        DbError::Internal(format!(
                            "column '{}' not in table '{}'",
                            sc.col, self.table.name
                        ))
                    })?;
                new_rec[col.offset..col.offset + col.len].copy_from_slice(&sc.value.to_raw(col)?);
            }

            self.fh.update_record(rid, &new_rec, Some(&self.ctx))?;

            for index in &self.table.indexes {
                if !self.index_touched(&index.cols) {
                    continue;
                }
                if let Some(ih) = self.sys.index_handle(&self.table.name, &index.col_names()) {
                    ih.delete_entry(&index.key_from_tuple(old.data()))?;
                    ih.insert_entry(&index.key_from_tuple(&new_rec), rid)?;
                }
            }
        }
        self.rids.clear();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        Ok(())
    }

    fn current(&self) -> Result<Option<Record>> {
        Ok(None)
    }

    fn current_rid(&self) -> Rid {
        Rid::invalid()
    }

    fn is_end(&self) -> bool {
        true
    }

    fn schema(&self) -> &[ColMeta] {
        &[]
    }
}
