//! Projection: narrows a child's tuples to a subset of columns.

use eyre::Result;

use super::{get_col, Executor};
use crate::catalog::ColMeta;
use crate::record::{Record, Rid};

pub struct ProjectionExecutor {
    child: Box<dyn Executor>,
    /// Source column metadata, in output order.
    src_cols: Vec<ColMeta>,
    schema: Vec<ColMeta>,
}

impl ProjectionExecutor {
    pub fn new(child: Box<dyn Executor>, col_names: &[String]) -> Result<Self> {
        let mut src_cols = Vec::with_capacity(col_names.len());
        let mut schema = Vec::with_capacity(col_names.len());
        let mut offset = 0usize;
        for name in col_names {
            let src = get_col(child.schema(), name)?.clone();
            let mut out = src.clone();
            out.offset = offset;
            offset += out.len;
            src_cols.push(src);
            schema.push(out);
        }
        Ok(Self {
            child,
            src_cols,
            schema,
        })
    }
}

impl Executor for ProjectionExecutor {
    fn begin(&mut self) -> Result<()> {
        self.child.begin()
    }

    fn next(&mut self) -> Result<()> {
        self.child.next()
    }

    fn current(&self) -> Result<Option<Record>> {
        let rec = match self.child.current()? {
            Some(rec) => rec,
            None => return Ok(None),
        };
        let mut out = Vec::with_capacity(self.tuple_len());
        for col in &self.src_cols {
            out.extend_from_slice(&rec.data()[col.offset..col.offset + col.len]);
        }
        Ok(Some(Record::new(out)))
    }

    fn current_rid(&self) -> Rid {
        self.child.current_rid()
    }

    fn is_end(&self) -> bool {
        self.child.is_end()
    }

    fn schema(&self) -> &[ColMeta] {
        &self.schema
    }
}
