//! Storage collaborator boundary.
//!
//! # Responsibility
//! - Define the `Storage` trait every engine call goes through.
//! - Provide the SQLite implementation and its connection bootstrap.
//!
//! # Invariants
//! - The core never holds a process-wide connection; callers pass one in.
//! - Collaborator failures surface as `DbError` and are never swallowed.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod open;
mod storage;

pub use open::{SqliteStorage, DEFAULT_BUSY_TIMEOUT_MS};
pub use storage::{ColumnInfo, LockMode, RowSet, Statement, Storage};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// The connection string cannot be interpreted.
    InvalidDsn(String),
    /// Opening or bootstrapping the connection failed.
    Connection {
        dsn: String,
        source: rusqlite::Error,
    },
    /// Transaction call made in the wrong state.
    TransactionState(&'static str),
}

impl DbError {
    /// Returns whether this error is a uniqueness/constraint violation.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::InvalidDsn(dsn) => write!(f, "invalid connection string `{dsn}`"),
            Self::Connection { dsn, source } => {
                write!(f, "failed to connect to `{dsn}`: {source}")
            }
            Self::TransactionState(message) => write!(f, "transaction state error: {message}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Connection { source, .. } => Some(source),
            Self::InvalidDsn(_) => None,
            Self::TransactionState(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
