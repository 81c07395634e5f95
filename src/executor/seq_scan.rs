//! Sequential scan over a table's record file.
//!
//! Takes the table-level shared lock at `begin`, then walks the record
//! file in rid order, yielding tuples that satisfy the scan conditions.
//! Each yielded record is read through the context, which S-locks it.

use std::sync::Arc;

use eyre::Result;

use super::{eval_conds, Condition, Executor};
use crate::catalog::ColMeta;
use crate::record::{Record, RecordFileHandle, RecordScan, Rid};
use crate::system::SystemManager;
use crate::txn::{Context, LockMode};

pub struct SeqScanExecutor {
    fh: Arc<RecordFileHandle>,
    schema: Vec<ColMeta>,
    conds: Vec<Condition>,
    ctx: Option<Context>,
    scan: Option<RecordScan>,
    rid: Rid,
}

impl SeqScanExecutor {
    pub fn new(
        sys: &SystemManager,
        table: &str,
        conds: Vec<Condition>,
        ctx: Option<Context>,
    ) -> Result<Self> {
        let meta = sys.table_meta(table)?;
        let fh = sys.table_file(table)?;
        Ok(Self {
            fh,
            schema: meta.cols,
            conds,
            ctx,
            scan: None,
            rid: Rid::invalid(),
        })
    }

    /// Walks the underlying scan forward to the next qualifying tuple.
    fn seek_match(&mut self) -> Result<()> {
        let scan = self.scan.as_mut().expect("seek before begin");
        while !scan.is_end() {
            let rid = scan.rid();
            let rec = self.fh.get_record(rid, self.ctx.as_ref())?;
            if eval_conds(&self.schema, &self.conds, rec.data())? {
                self.rid = rid;
                return Ok(());
            }
            scan.next()?;
        }
        self.rid = Rid::invalid();
        Ok(())
    }
}

impl Executor for SeqScanExecutor {
    fn begin(&mut self) -> Result<()> {
        if let Some(ctx) = &self.ctx {
            ctx.lock_table(self.fh.file_id(), LockMode::Shared)?;
        }
        self.scan = Some(RecordScan::new(Arc::clone(&self.fh))?);
        self.seek_match()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
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
