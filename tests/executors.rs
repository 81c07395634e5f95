//! Executor integration: scans, joins, projection, DML round-trips.

use std::sync::Arc;

use karstdb::catalog::{build_cols, ColType, Value};
use karstdb::errors::DbError;
use karstdb::executor::{
    CompOp, Condition, DeleteExecutor, Executor, IndexScanExecutor, InsertExecutor,
    NestedLoopJoinExecutor, ProjectionExecutor, SeqScanExecutor,
};
use karstdb::record::Rid;
use karstdb::system::SystemManager;
use karstdb::txn::{Context, LockManager, TransactionManager};
use tempfile::tempdir;

struct Harness {
    _dir: tempfile::TempDir,
    sys: Arc<SystemManager>,
    tm: TransactionManager,
    lm: Arc<LockManager>,
}

fn setup() -> Harness {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    SystemManager::create_database(&path).unwrap();
    let sys = Arc::new(SystemManager::open_database(&path).unwrap());
    let lm = Arc::new(LockManager::new());
    let tm = TransactionManager::new(Arc::clone(&lm));
    Harness {
        _dir: dir,
        sys,
        tm,
        lm,
    }
}

fn ctx(h: &Harness) -> Context {
    Context::new(Arc::clone(&h.lm), h.tm.begin())
}

fn insert(h: &Harness, c: &Context, table: &str, values: Vec<Value>) -> Rid {
    let mut exec = InsertExecutor::new(Arc::clone(&h.sys), table, values, c.clone()).unwrap();
    exec.begin().unwrap();
    exec.inserted_rid()
}

fn int_at(rec: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(rec[offset..offset + 4].try_into().unwrap())
}

#[test]
fn index_range_scan_returns_sorted_matches() {
    // Single-column int index, rows inserted out of order, range [2, 6].
    let h = setup();
    h.sys
        .create_table("t", build_cols(&[("a", ColType::Int, 0)]))
        .unwrap();
    h.sys.create_index("t", &["a".to_string()], None).unwrap();

    let c = ctx(&h);
    let mut rid_of = std::collections::HashMap::new();
    for v in [5, 1, 3, 7, 2, 4, 6] {
        rid_of.insert(v, insert(&h, &c, "t", vec![Value::Int(v)]));
    }

    let mut scan = IndexScanExecutor::new(
        &h.sys,
        "t",
        vec![
            Condition::with_value("a", CompOp::Ge, Value::Int(2)),
            Condition::with_value("a", CompOp::Le, Value::Int(6)),
        ],
        &["a".to_string()],
        Some(c.clone()),
    )
    .unwrap();

    scan.begin().unwrap();
    let mut got = Vec::new();
    while !scan.is_end() {
        let rec = scan.current().unwrap().unwrap();
        got.push((int_at(rec.data(), 0), scan.current_rid()));
        scan.next().unwrap();
    }

    let expected: Vec<(i32, Rid)> = (2..=6).map(|v| (v, rid_of[&v])).collect();
    assert_eq!(got, expected);
    h.tm.commit(&c.txn).unwrap();
}

#[test]
fn insert_value_count_and_type_errors() {
    let h = setup();
    h.sys
        .create_table(
            "t",
            build_cols(&[("a", ColType::Int, 0), ("b", ColType::Str, 8)]),
        )
        .unwrap();

    let c = ctx(&h);
    let err = InsertExecutor::new(Arc::clone(&h.sys), "t", vec![Value::Int(1)], c.clone())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::InvalidValueCount {
            expected: 2,
            actual: 1
        })
    ));

    let mut exec = InsertExecutor::new(
        Arc::clone(&h.sys),
        "t",
        vec![Value::Str("x".into()), Value::Str("y".into())],
        c.clone(),
    )
    .unwrap();
    let err = exec.begin().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::IncompatibleType { .. })
    ));
    h.tm.abort(&c.txn, &h.sys).unwrap();
}

#[test]
fn nested_loop_join_matches_on_key_equality() {
    let h = setup();
    h.sys
        .create_table(
            "emp",
            build_cols(&[("eid", ColType::Int, 0), ("dept", ColType::Int, 0)]),
        )
        .unwrap();
    h.sys
        .create_table(
            "dep",
            build_cols(&[("did", ColType::Int, 0), ("floor", ColType::Int, 0)]),
        )
        .unwrap();

    let c = ctx(&h);
    for (eid, dept) in [(1, 10), (2, 20), (3, 10)] {
        insert(&h, &c, "emp", vec![Value::Int(eid), Value::Int(dept)]);
    }
    for (did, floor) in [(10, 1), (20, 2)] {
        insert(&h, &c, "dep", vec![Value::Int(did), Value::Int(floor)]);
    }

    let left = Box::new(
        SeqScanExecutor::new(&h.sys, "emp", Vec::new(), Some(c.clone())).unwrap(),
    );
    let right = Box::new(
        SeqScanExecutor::new(&h.sys, "dep", Vec::new(), Some(c.clone())).unwrap(),
    );
    let mut join = NestedLoopJoinExecutor::new(
        left,
        right,
        vec![Condition::with_col("dept", CompOp::Eq, "did")],
    );

    join.begin().unwrap();
    let mut got = Vec::new();
    while !join.is_end() {
        let rec = join.current().unwrap().unwrap();
        got.push((int_at(rec.data(), 0), int_at(rec.data(), 12)));
        join.next().unwrap();
    }
    got.sort_unstable();
    assert_eq!(got, vec![(1, 1), (2, 2), (3, 1)]);
    h.tm.commit(&c.txn).unwrap();
}

#[test]
fn projection_narrows_and_reoffsets_columns() {
    let h = setup();
    h.sys
        .create_table(
            "t",
            build_cols(&[
                ("a", ColType::Int, 0),
                ("b", ColType::Str, 8),
                ("c", ColType::Int, 0),
            ]),
        )
        .unwrap();

    let c = ctx(&h);
    insert(
        &h,
        &c,
        "t",
        vec![Value::Int(1), Value::Str("mid".into()), Value::Int(99)],
    );

    let child = Box::new(SeqScanExecutor::new(&h.sys, "t", Vec::new(), Some(c.clone())).unwrap());
    let mut proj = ProjectionExecutor::new(child, &["c".to_string(), "a".to_string()]).unwrap();

    proj.begin().unwrap();
    assert_eq!(proj.tuple_len(), 8);
    assert_eq!(proj.schema()[0].name, "c");
    assert_eq!(proj.schema()[0].offset, 0);
    assert_eq!(proj.schema()[1].offset, 4);

    let rec = proj.current().unwrap().unwrap();
    assert_eq!(int_at(rec.data(), 0), 99);
    assert_eq!(int_at(rec.data(), 4), 1);
    h.tm.commit(&c.txn).unwrap();
}

#[test]
fn delete_executor_removes_rows_and_index_entries() {
    let h = setup();
    h.sys
        .create_table("t", build_cols(&[("a", ColType::Int, 0)]))
        .unwrap();
    h.sys.create_index("t", &["a".to_string()], None).unwrap();

    let c = ctx(&h);
    let rids: Vec<Rid> = (0..6)
        .map(|v| insert(&h, &c, "t", vec![Value::Int(v)]))
        .collect();

    // Delete the even rows through the executor.
    let victims: Vec<Rid> = rids.iter().step_by(2).copied().collect();
    let mut del = DeleteExecutor::new(Arc::clone(&h.sys), "t", victims, c.clone()).unwrap();
    del.begin().unwrap();

    let ih = h.sys.index_handle("t", &["a".to_string()]).unwrap();
    for v in 0..6 {
        let expected = if v % 2 == 0 { None } else { Some(rids[v as usize]) };
        assert_eq!(ih.get_value(&(v as i32).to_le_bytes()).unwrap(), expected);
    }

    let mut scan = SeqScanExecutor::new(&h.sys, "t", Vec::new(), Some(c.clone())).unwrap();
    scan.begin().unwrap();
    let mut live = Vec::new();
    while !scan.is_end() {
        let rec = scan.current().unwrap().unwrap();
        live.push(int_at(rec.data(), 0));
        scan.next().unwrap();
    }
    assert_eq!(live, vec![1, 3, 5]);
    h.tm.commit(&c.txn).unwrap();
}

#[test]
fn seq_scan_with_column_to_column_predicate() {
    let h = setup();
    h.sys
        .create_table(
            "t",
            build_cols(&[("x", ColType::Int, 0), ("y", ColType::Int, 0)]),
        )
        .unwrap();

    let c = ctx(&h);
    for (x, y) in [(1, 1), (2, 5), (3, 3)] {
        insert(&h, &c, "t", vec![Value::Int(x), Value::Int(y)]);
    }

    let mut scan = SeqScanExecutor::new(
        &h.sys,
        "t",
        vec![Condition::with_col("x", CompOp::Eq, "y")],
        Some(c.clone()),
    )
    .unwrap();
    scan.begin().unwrap();
    let mut got = Vec::new();
    while !scan.is_end() {
        let rec = scan.current().unwrap().unwrap();
        got.push(int_at(rec.data(), 0));
        scan.next().unwrap();
    }
    assert_eq!(got, vec![1, 3]);
    h.tm.commit(&c.txn).unwrap();
}
