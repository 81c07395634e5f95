//! # System Manager
//!
//! The DDL surface and handle registry of one open database. A database
//! is a filesystem directory holding the JSON catalog (`db.meta`), one
//! record file per table (`<table>.tbd`), and one B+tree file per index
//! (`<table>_<cols>.idx`).
//!
//! The system manager owns the disk manager and buffer pool shared by
//! every handle, keeps the catalog in memory, and rewrites the metadata
//! file on every DDL statement. DML goes through the handles it vends
//! (`table_file`, `index_handle`); transaction rollback resolves tables
//! and indexes through the same accessors, so objects dropped mid-
//! transaction simply resolve to nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result};
use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::catalog::{ColMeta, DbMeta, IndexMeta, TableMeta};
use crate::config::{BUFFER_POOL_SIZE, DB_META_FILE};
use crate::errors::DbError;
use crate::index::BPlusTree;
use crate::record::{RecordFileHandle, RecordScan};
use crate::storage::{BufferPoolManager, DiskManager};

const TABLE_EXT: &str = "tbd";
const INDEX_EXT: &str = "idx";

struct SysState {
    db: DbMeta,
    table_files: HashMap<String, Arc<RecordFileHandle>>,
    index_files: HashMap<String, Arc<BPlusTree>>,
}

impl std::fmt::Debug for SystemManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemManager")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

pub struct SystemManager {
    root: PathBuf,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    state: Mutex<SysState>,
}

impl SystemManager {
    /// Creates a database: a fresh directory with an empty catalog.
    pub fn create_database(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            return Err(DbError::DatabaseExists(path.display().to_string()).into());
        }
        std::fs::create_dir_all(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        DbMeta::new(name).save(path.join(DB_META_FILE))?;
        info!("created database at '{}'", path.display());
        Ok(())
    }

    /// Removes a database directory. The database must not be open.
    pub fn drop_database(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DbError::DatabaseNotFound(path.display().to_string()).into());
        }
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    /// Opens a database directory, loading the catalog and every table
    /// and index file it names.
    pub fn open_database(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_database_with_pool_size(path, BUFFER_POOL_SIZE)
    }

    pub fn open_database_with_pool_size(path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(DbError::DatabaseNotFound(root.display().to_string()).into());
        }
        let db = DbMeta::load(root.join(DB_META_FILE))?;

        let disk = Arc::new(DiskManager::new());
        let pool = Arc::new(BufferPoolManager::new(Arc::clone(&disk), pool_size));

        let mut table_files = HashMap::new();
        let mut index_files = HashMap::new();
        for (name, table) in &db.tables {
            let fh = RecordFileHandle::open(
                Arc::clone(&pool),
                root.join(format!("{}.{}", name, TABLE_EXT)),
                name.clone(),
            )?;
            table_files.insert(name.clone(), Arc::new(fh));
            for index in &table.indexes {
                let ih = BPlusTree::open(
                    Arc::clone(&pool),
                    root.join(format!("{}.{}", index.name(), INDEX_EXT)),
                )?;
                index_files.insert(index.name(), Arc::new(ih));
            }
        }

        Ok(Self {
            root,
            disk,
            pool,
            state: Mutex::new(SysState {
                db,
                table_files,
                index_files,
            }),
        })
    }

    pub fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    pub fn db_name(&self) -> String {
        self.state.lock().db.name.clone()
    }

    /// Creates a table from a prepared column layout.
    pub fn create_table(&self, name: &str, cols: Vec<ColMeta>) -> Result<()> {
        ensure!(!cols.is_empty(), "a table needs at least one column");
        let mut st = self.state.lock();
        if st.db.is_table(name) {
            return Err(DbError::TableExists(name.to_string()).into());
        }

        let table = TableMeta {
            name: name.to_string(),
            cols,
            indexes: Vec::new(),
        };
        let path = self.table_path(name);
        RecordFileHandle::create(&self.disk, &path, table.record_size())?;
        let fh = RecordFileHandle::open(Arc::clone(&self.pool), &path, name)?;

        st.db.tables.insert(name.to_string(), table);
        st.table_files.insert(name.to_string(), Arc::new(fh));
        self.flush_meta(&st)?;
        info!("created table '{}'", name);
        Ok(())
    }

    /// Drops a table, its file, and every index built on it.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        let table = match st.db.tables.remove(name) {
            Some(t) => t,
            None => return Err(DbError::TableNotFound(name.to_string()).into()),
        };

        for index in &table.indexes {
            if let Some(ih) = st.index_files.remove(&index.name()) {
                ih.close()?;
                self.disk
                    .destroy_file(self.index_path(&index.name()))?;
            }
        }
        if let Some(fh) = st.table_files.remove(name) {
            fh.close()?;
            self.disk.destroy_file(self.table_path(name))?;
        }
        self.flush_meta(&st)?;
        info!("dropped table '{}'", name);
        Ok(())
    }

    /// Creates an index over `col_names` of `table` and bulk-loads the
    /// existing rows. `order_override` lowers the node order (structural
    /// tests use small orders).
    pub fn create_index(
        &self,
        table: &str,
        col_names: &[String],
        order_override: Option<usize>,
    ) -> Result<()> {
        let mut st = self.state.lock();
        let table_meta = st.db.get_table(table)?;
        if table_meta.has_index(col_names) {
            return Err(DbError::IndexExists(format!("{}({})", table, col_names.join(","))).into());
        }
        let cols: Vec<ColMeta> = col_names
            .iter()
            .map(|n| table_meta.get_col(n).cloned())
            .collect::<Result<_>>()?;
        let index = IndexMeta::new(table, cols);

        let path = self.index_path(&index.name());
        BPlusTree::create(
            &self.disk,
            &path,
            &index.col_type_tags(),
            &index.col_lens(),
            order_override,
        )?;
        let ih = Arc::new(BPlusTree::open(Arc::clone(&self.pool), &path)?);

        // Bulk-load rows already in the table.
        let fh = st
            .table_files
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        let mut scan = RecordScan::new(Arc::clone(&fh))?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = fh.get_record(rid, None)?;
            ih.insert_entry(&index.key_from_tuple(record.data()), rid)?;
            scan.next()?;
        }

        st.index_files.insert(index.name(), ih);
        st.db.get_table_mut(table)?.indexes.push(index);
        self.flush_meta(&st)?;
        info!("created index on {}({})", table, col_names.join(","));
        Ok(())
    }

    /// Drops the index over `col_names` of `table`.
    pub fn drop_index(&self, table: &str, col_names: &[String]) -> Result<()> {
        let mut st = self.state.lock();
        let table_meta = st.db.get_table_mut(table)?;
        let pos = table_meta
            .indexes
            .iter()
            .position(|ix| ix.col_names() == col_names)
            .ok_or_else(|| {
                DbError::IndexNotFound(format!("{}({})", table, col_names.join(",")))
            })?;
        let index = table_meta.indexes.remove(pos);

        if let Some(ih) = st.index_files.remove(&index.name()) {
            ih.close()?;
            self.disk.destroy_file(self.index_path(&index.name()))?;
        }
        self.flush_meta(&st)?;
        info!("dropped index on {}({})", table, col_names.join(","));
        Ok(())
    }

    /// A snapshot of the table's schema.
    pub fn table_meta(&self, name: &str) -> Result<TableMeta> {
        self.state.lock().db.get_table(name).cloned()
    }

    /// The record file handle of `name`.
    pub fn table_file(&self, name: &str) -> Result<Arc<RecordFileHandle>> {
        self.state
            .lock()
            .table_files
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()).into())
    }

    /// The B+tree handle of the index over `col_names` of `table`, if
    /// both the table and the index still exist.
    pub fn index_handle(&self, table: &str, col_names: &[String]) -> Option<Arc<BPlusTree>> {
        let st = self.state.lock();
        let meta = st.db.tables.get(table)?;
        let index = meta.get_index_meta(col_names)?;
        st.index_files.get(&index.name()).cloned()
    }

    /// Flushes every table, every index, and the catalog to disk.
    pub fn flush_all(&self) -> Result<()> {
        let st = self.state.lock();
        for fh in st.table_files.values() {
            fh.flush()?;
        }
        for ih in st.index_files.values() {
            ih.flush()?;
        }
        self.flush_meta(&st)
    }

    /// Flushes everything and closes every file.
    pub fn close(&self) -> Result<()> {
        let mut st = self.state.lock();
        for (_, fh) in st.table_files.drain() {
            fh.close()?;
        }
        for (_, ih) in st.index_files.drain() {
            ih.close()?;
        }
        self.flush_meta(&st)
    }

    fn flush_meta(&self, st: &SysState) -> Result<()> {
        st.db.save(self.root.join(DB_META_FILE))
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, TABLE_EXT))
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, INDEX_EXT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_cols, ColType, Value};
    use tempfile::tempdir;

    fn open_db() -> (tempfile::TempDir, SystemManager) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        SystemManager::create_database(&path).unwrap();
        let sys = SystemManager::open_database(&path).unwrap();
        (dir, sys)
    }

    fn int_row(table: &TableMeta, v: i32) -> Vec<u8> {
        Value::Int(v).to_raw(&table.cols[0]).unwrap()
    }

    #[test]
    fn create_database_twice_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        SystemManager::create_database(&path).unwrap();
        let err = SystemManager::create_database(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::DatabaseExists(_))
        ));
    }

    #[test]
    fn open_missing_database_fails() {
        let dir = tempdir().unwrap();
        let err = SystemManager::open_database(dir.path().join("nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::DatabaseNotFound(_))
        ));
    }

    #[test]
    fn table_lifecycle_and_catalog_errors() {
        let (_dir, sys) = open_db();
        let cols = build_cols(&[("a", ColType::Int, 0)]);
        sys.create_table("t", cols.clone()).unwrap();

        let err = sys.create_table("t", cols).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::TableExists(_))
        ));

        sys.drop_table("t").unwrap();
        let err = sys.drop_table("t").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::TableNotFound(_))
        ));
    }

    #[test]
    fn create_index_bulk_loads_existing_rows() {
        let (_dir, sys) = open_db();
        sys.create_table("t", build_cols(&[("a", ColType::Int, 0)]))
            .unwrap();
        let table = sys.table_meta("t").unwrap();
        let fh = sys.table_file("t").unwrap();

        let mut rids = Vec::new();
        for v in [5, 1, 3] {
            rids.push(fh.insert_record(&int_row(&table, v), None).unwrap());
        }

        sys.create_index("t", &["a".to_string()], None).unwrap();
        let ih = sys.index_handle("t", &["a".to_string()]).unwrap();
        assert_eq!(
            ih.get_value(&1i32.to_le_bytes()).unwrap(),
            Some(rids[1])
        );
        assert_eq!(
            ih.get_value(&5i32.to_le_bytes()).unwrap(),
            Some(rids[0])
        );
    }

    #[test]
    fn duplicate_and_missing_index_errors() {
        let (_dir, sys) = open_db();
        sys.create_table("t", build_cols(&[("a", ColType::Int, 0)]))
            .unwrap();
        sys.create_index("t", &["a".to_string()], None).unwrap();

        let err = sys.create_index("t", &["a".to_string()], None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::IndexExists(_))
        ));

        sys.drop_index("t", &["a".to_string()]).unwrap();
        let err = sys.drop_index("t", &["a".to_string()]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::IndexNotFound(_))
        ));
        assert!(sys.index_handle("t", &["a".to_string()]).is_none());
    }

    #[test]
    fn reopen_restores_catalog_and_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        SystemManager::create_database(&path).unwrap();

        let rid;
        {
            let sys = SystemManager::open_database(&path).unwrap();
            sys.create_table("t", build_cols(&[("a", ColType::Int, 0)]))
                .unwrap();
            let table = sys.table_meta("t").unwrap();
            rid = sys
                .table_file("t")
                .unwrap()
                .insert_record(&int_row(&table, 9), None)
                .unwrap();
            sys.close().unwrap();
        }

        let sys = SystemManager::open_database(&path).unwrap();
        let rec = sys.table_file("t").unwrap().get_record(rid, None).unwrap();
        assert_eq!(&rec.data()[..4], &9i32.to_le_bytes());
    }
}
