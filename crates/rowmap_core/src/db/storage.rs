//! Storage collaborator contract and its wire types.

use super::DbResult;
use crate::mapper::records_from_rows;
use crate::model::{ModelDescriptor, Record, Value};
use crate::query::QueryResult;
use std::collections::BTreeMap;

/// Row-locking strength requested by a plan.
///
/// Carried to the storage untouched; interpretation is the storage's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `FOR UPDATE`
    Update,
    /// `FOR SHARE`
    Share,
}

impl LockMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Share => "share",
        }
    }
}

/// SQL text plus positional params, ready for the storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    pub lock: Option<LockMode>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            lock: None,
        }
    }

    pub fn with_lock(mut self, lock: Option<LockMode>) -> Self {
        self.lock = lock;
        self
    }
}

/// Materialized statement result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows changed by a mutating statement; `0` for reads.
    pub rows_affected: usize,
    pub last_insert_id: Option<i64>,
}

impl RowSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Index of `column`, case-insensitive.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))
    }

    /// First column of the first row, if any.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }

    /// Rows mapped onto `model`; columns the model lacks are ignored.
    pub fn to_records(&self, model: &ModelDescriptor) -> QueryResult<Vec<Record>> {
        records_from_rows(model, self)
    }

    /// Rows as `column -> value` maps.
    pub fn to_maps(&self) -> Vec<BTreeMap<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<BTreeMap<_, _>>()
            })
            .collect()
    }
}

/// One live column reported by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// External relational-store interface the core depends on.
///
/// Implementations are not required to be thread-safe; callers sharing one
/// storage must serialize access themselves.
pub trait Storage {
    /// Runs one statement and materializes any returned rows.
    fn execute(&mut self, statement: &Statement) -> DbResult<RowSet>;
    fn begin_transaction(&mut self) -> DbResult<()>;
    fn commit(&mut self) -> DbResult<()>;
    fn rollback(&mut self) -> DbResult<()>;
    fn in_transaction(&self) -> bool;
    /// Lists live columns of `table`; empty when the table does not exist.
    fn list_columns(&mut self, table: &str) -> DbResult<Vec<ColumnInfo>>;
    /// Names of the indexes defined on `table`.
    fn list_indexes(&mut self, table: &str) -> DbResult<Vec<String>>;
}
