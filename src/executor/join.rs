//! Nested-loop join.
//!
//! For every tuple of the left child, the right child is rewound and
//! scanned in full; concatenated tuples that satisfy the join conditions
//! are emitted. The output schema is the left schema followed by the
//! right schema with offsets shifted, so conditions may reference
//! columns of either side (column names must be distinct across the two
//! inputs).

use eyre::Result;

use super::{eval_conds, Condition, Executor};
use crate::catalog::ColMeta;
use crate::record::{Record, Rid};

pub struct NestedLoopJoinExecutor {
    left: Box<dyn Executor>,
    right: Box<dyn Executor>,
    conds: Vec<Condition>,
    schema: Vec<ColMeta>,
    current: Option<Record>,
}

impl NestedLoopJoinExecutor {
    pub fn new(left: Box<dyn Executor>, right: Box<dyn Executor>, conds: Vec<Condition>) -> Self {
        let left_len = left.tuple_len();
        let mut schema = left.schema().to_vec();
        for col in right.schema() {
            let mut col = col.clone();
            col.offset += left_len;
            schema.push(col);
        }
        Self {
            left,
            right,
            conds,
            schema,
            current: None,
        }
    }

    fn joined_tuple(&self) -> Result<Option<Vec<u8>>> {
        let (left, right) = match (self.left.current()?, self.right.current()?) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(None),
        };
        let mut tuple = Vec::with_capacity(left.len() + right.len());
        tuple.extend_from_slice(left.data());
        tuple.extend_from_slice(right.data());
        Ok(Some(tuple))
    }

    /// Advances the pair of children until a qualifying combination is
    /// under the cursors.
    fn seek_match(&mut self) -> Result<()> {
        self.current = None;
        while !self.left.is_end() {
            while !self.right.is_end() {
                if let Some(tuple) = self.joined_tuple()? {
                    if eval_conds(&self.schema, &self.conds, &tuple)? {
                        self.current = Some(Record::new(tuple));
                        return Ok(());
                    }
                }
                self.right.next()?;
            }
            self.left.next()?;
            self.right.begin()?;
        }
        Ok(())
    }
}

impl Executor for NestedLoopJoinExecutor {
    fn begin(&mut self) -> Result<()> {
        self.left.begin()?;
        self.right.begin()?;
        self.seek_match()
    }

    fn next(&mut self) -> Result<()> {
        if self.left.is_end() {
            return Ok(());
        }
        self.right.next()?;
        self.seek_match()
    }

    fn current(&self) -> Result<Option<Record>> {
        Ok(self.current.clone())
    }

    fn current_rid(&self) -> Rid {
        // Joined rows are synthesized; they have no storage address.
        Rid::invalid()
    }

    fn is_end(&self) -> bool {
        self.current.is_none()
    }

    fn schema(&self) -> &[ColMeta] {
        &self.schema
    }
}
