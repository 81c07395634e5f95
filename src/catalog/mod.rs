//! # Catalog
//!
//! Schema metadata for one database: column layouts, table definitions,
//! index definitions, and typed literal values. The whole catalog
//! serializes to a pretty-printed JSON file (`db.meta`) inside the
//! database directory and is rewritten on every DDL statement.
//!
//! Column types are fixed-width: `Int` (4 bytes), `Float` (4 bytes), and
//! `Str` with a declared byte length (shorter strings are zero-padded).
//! A record is the concatenation of its column encodings; a composite
//! index key is the concatenation of the indexed columns' raw bytes in
//! declared order.

use std::collections::HashMap;
use std::path::Path;

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::errors::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColType {
    Int,
    Float,
    Str,
}

impl ColType {
    /// Tag byte as stored in index file headers.
    pub(crate) fn tag(self) -> u8 {
        match self {
            ColType::Int => crate::index::TAG_INT,
            ColType::Float => crate::index::TAG_FLOAT,
            ColType::Str => crate::index::TAG_STRING,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColType,
    /// Byte offset of this column inside a record.
    pub offset: usize,
    /// Fixed byte width of this column.
    pub len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub table: String,
    pub cols: Vec<ColMeta>,
    pub col_tot_len: usize,
}

impl IndexMeta {
    pub fn new(table: impl Into<String>, cols: Vec<ColMeta>) -> Self {
        let col_tot_len = cols.iter().map(|c| c.len).sum();
        Self {
            table: table.into(),
            cols,
            col_tot_len,
        }
    }

    /// `<table>_<col>_<col>...`, the index's file stem.
    pub fn name(&self) -> String {
        let mut name = self.table.clone();
        for col in &self.cols {
            name.push('_');
            name.push_str(&col.name);
        }
        name
    }

    pub fn col_names(&self) -> Vec<String> {
        self.cols.iter().map(|c| c.name.clone()).collect()
    }

    pub fn col_type_tags(&self) -> Vec<u8> {
        self.cols.iter().map(|c| c.col_type.tag()).collect()
    }

    pub fn col_lens(&self) -> Vec<i32> {
        self.cols.iter().map(|c| c.len as i32).collect()
    }

    /// Extracts this index's composite key from a full tuple image.
    pub fn key_from_tuple(&self, tuple: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.col_tot_len);
        for col in &self.cols {
            key.extend_from_slice(&tuple[col.offset..col.offset + col.len]);
        }
        key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub cols: Vec<ColMeta>,
    pub indexes: Vec<IndexMeta>,
}

impl TableMeta {
    pub fn record_size(&self) -> usize {
        self.cols.iter().map(|c| c.len).sum()
    }

    pub fn get_col(&self, name: &str) -> Result<&ColMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                DbError::Internal(format!("column '{}' not in table '{}'", name, self.name)).into()
            })
    }

    pub fn get_index_meta(&self, col_names: &[String]) -> Option<&IndexMeta> {
        self.indexes
            .iter()
            .find(|ix| ix.col_names() == col_names)
    }

    pub fn has_index(&self, col_names: &[String]) -> bool {
        self.get_index_meta(col_names).is_some()
    }
}

/// The whole catalog of one database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbMeta {
    pub name: String,
    pub tables: HashMap<String, TableMeta>,
}

impl DbMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: HashMap::new(),
        }
    }

    pub fn get_table(&self, name: &str) -> Result<&TableMeta> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()).into())
    }

    pub fn get_table_mut(&mut self, name: &str) -> Result<&mut TableMeta> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()).into())
    }

    pub fn is_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Writes the catalog as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self).wrap_err("failed to serialize catalog")?;
        std::fs::write(&path, content).wrap_err_with(|| {
            format!("failed to write catalog '{}'", path.as_ref().display())
        })?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(&path).wrap_err_with(|| {
            format!("failed to read catalog '{}'", path.as_ref().display())
        })?;
        serde_json::from_str(&content).wrap_err("failed to parse catalog")
    }
}

/// A typed literal, convertible to and from the fixed-width column
/// encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Str(String),
}

impl Value {
    pub fn col_type(&self) -> ColType {
        match self {
            Value::Int(_) => ColType::Int,
            Value::Float(_) => ColType::Float,
            Value::Str(_) => ColType::Str,
        }
    }

    /// Encodes into a column's raw bytes, checking type and width.
    pub fn to_raw(&self, col: &ColMeta) -> Result<Vec<u8>> {
        if self.col_type() != col.col_type {
            return Err(DbError::IncompatibleType {
                expected: col.col_type,
                actual: self.col_type(),
            }
            .into());
        }
        match self {
            Value::Int(v) => Ok(v.to_le_bytes().to_vec()),
            Value::Float(v) => Ok(v.to_le_bytes().to_vec()),
            Value::Str(s) => {
                if s.len() > col.len {
                    return Err(DbError::IncompatibleType {
                        expected: col.col_type,
                        actual: ColType::Str,
                    }
                    .into());
                }
                let mut raw = vec![0u8; col.len];
                raw[..s.len()].copy_from_slice(s.as_bytes());
                Ok(raw)
            }
        }
    }

    /// Decodes a column's raw bytes.
    pub fn from_raw(raw: &[u8], col_type: ColType) -> Value {
        match col_type {
            ColType::Int => Value::Int(i32::from_le_bytes(raw[..4].try_into().unwrap())),
            ColType::Float => Value::Float(f32::from_le_bytes(raw[..4].try_into().unwrap())),
            ColType::Str => {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Value::Str(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
        }
    }
}

/// Builds the column layout for a `(name, type, len)` declaration list,
/// assigning offsets in declared order. `len` is ignored for the numeric
/// types.
pub fn build_cols(decls: &[(&str, ColType, usize)]) -> Vec<ColMeta> {
    let mut cols = Vec::with_capacity(decls.len());
    let mut offset = 0usize;
    for (name, col_type, len) in decls {
        let len = match col_type {
            ColType::Int | ColType::Float => 4,
            ColType::Str => *len,
        };
        cols.push(ColMeta {
            name: (*name).to_string(),
            col_type: *col_type,
            offset,
            len,
        });
        offset += len;
    }
    cols
}
