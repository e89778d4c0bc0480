//! Schema registry and additive reconciliation.
//!
//! # Responsibility
//! - Track model descriptors by name.
//! - Bring the live store in line with registered descriptors.
//!
//! # Invariants
//! - Reconciliation is additive only: tables and columns are never dropped
//!   or narrowed.
//! - Reconciling an already-matching schema issues no DDL.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod registry;

pub use registry::{reconcile_model, ReconcileReport, SchemaRegistry};

pub type SchemaResult<T> = Result<T, SchemaError>;

#[derive(Debug)]
pub enum SchemaError {
    /// Live column type cannot hold the declared field type.
    Conflict {
        table: String,
        column: String,
        existing: String,
        declared: &'static str,
    },
    /// Existing table lacks the declared primary key column.
    MissingPrimaryKey { table: String, column: String },
    UnknownModel(String),
    Db(DbError),
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict {
                table,
                column,
                existing,
                declared,
            } => write!(
                f,
                "schema conflict on `{table}.{column}`: live type `{existing}` cannot hold declared {declared}"
            ),
            Self::MissingPrimaryKey { table, column } => write!(
                f,
                "table `{table}` exists without primary key column `{column}`"
            ),
            Self::UnknownModel(name) => write!(f, "model not registered: {name}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SchemaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Conflict { .. } => None,
            Self::MissingPrimaryKey { .. } => None,
            Self::UnknownModel(_) => None,
        }
    }
}

impl From<DbError> for SchemaError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}
