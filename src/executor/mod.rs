//! # Executors
//!
//! The iterator-style consumers of the storage contract. Each executor
//! exposes the same cursor surface — position on the first qualifying
//! tuple with `begin`, advance with `next`, read through `current` /
//! `current_rid`, probe `is_end` — plus its output schema.
//!
//! Scans acquire the table-level shared lock before producing rows and
//! read records through the transactional context, so every row a
//! transaction observes is S-locked at record granularity. Write
//! executors (insert / update / delete) route mutations through the same
//! context, which both acquires IX/X locks and feeds the undo log.
//!
//! Predicates are [`Condition`]s over the executor's schema: a column
//! compared against a literal or another column, evaluated on the raw
//! fixed-width tuple bytes.

mod dml;
mod index_scan;
mod join;
mod projection;
mod seq_scan;

pub use dml::{DeleteExecutor, InsertExecutor, SetClause, UpdateExecutor};
pub use index_scan::IndexScanExecutor;
pub use join::NestedLoopJoinExecutor;
pub use projection::ProjectionExecutor;
pub use seq_scan::SeqScanExecutor;

use std::cmp::Ordering;

use eyre::Result;

use crate::catalog::{ColMeta, ColType, Value};
use crate::errors::DbError;
use crate::record::{Record, Rid};

/// Volcano-style cursor over a stream of tuples.
pub trait Executor {
    /// Positions the cursor on the first qualifying tuple. Also serves
    /// as rewind.
    fn begin(&mut self) -> Result<()>;

    /// Advances to the next qualifying tuple.
    fn next(&mut self) -> Result<()>;

    /// The tuple under the cursor, or `None` at the end.
    fn current(&self) -> Result<Option<Record>>;

    /// Rid of the tuple under the cursor. Invalid for synthesized rows
    /// (joins, projections).
    fn current_rid(&self) -> Rid;

    fn is_end(&self) -> bool;

    fn schema(&self) -> &[ColMeta];

    fn tuple_len(&self) -> usize {
        self.schema().iter().map(|c| c.len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Right-hand side of a condition: a literal or another column.
#[derive(Debug, Clone)]
pub enum RhsOperand {
    Value(Value),
    Col(String),
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub lhs_col: String,
    pub op: CompOp,
    pub rhs: RhsOperand,
}

impl Condition {
    pub fn with_value(lhs_col: impl Into<String>, op: CompOp, value: Value) -> Self {
        Self {
            lhs_col: lhs_col.into(),
            op,
            rhs: RhsOperand::Value(value),
        }
    }

    pub fn with_col(lhs_col: impl Into<String>, op: CompOp, rhs_col: impl Into<String>) -> Self {
        Self {
            lhs_col: lhs_col.into(),
            op,
            rhs: RhsOperand::Col(rhs_col.into()),
        }
    }
}

pub(crate) fn get_col<'a>(schema: &'a [ColMeta], name: &str) -> Result<&'a ColMeta> {
    schema
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| DbError::Internal(format!("column '{}' not in schema", name)).into())
}

fn compare_raw(a: &[u8], b: &[u8], col_type: ColType) -> Ordering {
    match col_type {
        ColType::Int => {
            let ia = i32::from_le_bytes(a[..4].try_into().expect("int column is 4 bytes"));
            let ib = i32::from_le_bytes(b[..4].try_into().expect("int column is 4 bytes"));
            ia.cmp(&ib)
        }
        ColType::Float => {
            let fa = f32::from_le_bytes(a[..4].try_into().expect("float column is 4 bytes"));
            let fb = f32::from_le_bytes(b[..4].try_into().expect("float column is 4 bytes"));
            fa.total_cmp(&fb)
        }
        ColType::Str => a.cmp(b),
    }
}

fn eval_cond(schema: &[ColMeta], cond: &Condition, rec: &[u8]) -> Result<bool> {
    let lhs_col = get_col(schema, &cond.lhs_col)?;
    let lhs = &rec[lhs_col.offset..lhs_col.offset + lhs_col.len];

    let rhs: Vec<u8> = match &cond.rhs {
        RhsOperand::Value(v) => {
            // Cross-type comparisons never match.
            if v.col_type() != lhs_col.col_type {
                return Ok(false);
            }
            v.to_raw(lhs_col)?
        }
        RhsOperand::Col(name) => {
            let rhs_col = get_col(schema, name)?;
            if rhs_col.col_type != lhs_col.col_type {
                return Ok(false);
            }
            rec[rhs_col.offset..rhs_col.offset + rhs_col.len].to_vec()
        }
    };

    let ord = compare_raw(lhs, &rhs, lhs_col.col_type);
    Ok(match cond.op {
        CompOp::Eq => ord == Ordering::Equal,
        CompOp::Ne => ord != Ordering::Equal,
        CompOp::Lt => ord == Ordering::Less,
        CompOp::Gt => ord == Ordering::Greater,
        CompOp::Le => ord != Ordering::Greater,
        CompOp::Ge => ord != Ordering::Less,
    })
}

/// Conjunction of all conditions against one tuple.
pub fn eval_conds(schema: &[ColMeta], conds: &[Condition], rec: &[u8]) -> Result<bool> {
    for cond in conds {
        if !eval_cond(schema, cond, rec)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_cols;

    fn schema() -> Vec<ColMeta> {
        build_cols(&[("a", ColType::Int, 0), ("b", ColType::Str, 4)])
    }

    fn row(a: i32, b: &str) -> Vec<u8> {
        let mut rec = vec![0u8; 8];
        rec[..4].copy_from_slice(&a.to_le_bytes());
        rec[4..4 + b.len()].copy_from_slice(b.as_bytes());
        rec
    }

    #[test]
    fn literal_comparisons() {
        let s = schema();
        let rec = row(5, "abc");

        let cond = Condition::with_value("a", CompOp::Ge, Value::Int(5));
        assert!(eval_conds(&s, &[cond], &rec).unwrap());

        let cond = Condition::with_value("a", CompOp::Lt, Value::Int(5));
        assert!(!eval_conds(&s, &[cond], &rec).unwrap());

        let cond = Condition::with_value("b", CompOp::Eq, Value::Str("abc".into()));
        assert!(eval_conds(&s, &[cond], &rec).unwrap());
    }

    #[test]
    fn cross_type_comparison_is_false() {
        let s = schema();
        let rec = row(5, "abc");
        let cond = Condition::with_value("a", CompOp::Eq, Value::Str("5".into()));
        assert!(!eval_conds(&s, &[cond], &rec).unwrap());
    }

    #[test]
    fn conjunction_short_circuits() {
        let s = schema();
        let rec = row(5, "abc");
        let conds = [
            Condition::with_value("a", CompOp::Eq, Value::Int(5)),
            Condition::with_value("b", CompOp::Ne, Value::Str("abc".into())),
        ];
        assert!(!eval_conds(&s, &conds, &rec).unwrap());
    }

    #[test]
    fn unknown_column_is_an_error() {
        let s = schema();
        let rec = row(1, "x");
        let cond = Condition::with_value("zzz", CompOp::Eq, Value::Int(1));
        assert!(eval_conds(&s, &[cond], &rec).is_err());
    }
}
