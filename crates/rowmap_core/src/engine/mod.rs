//! Query execution engine.
//!
//! # Responsibility
//! - Execute query plans against a [`crate::db::Storage`].
//! - Enforce the bulk-mutation safety gate, soft-delete visibility and
//!   conflict policies.
//! - Keep record lifecycle state in step with storage.
//!
//! # Invariants
//! - An unconditioned update/delete/restore never reaches storage unless
//!   global mutation is explicitly allowed.
//! - A failed batch insert leaves no record of that batch persisted.
//! - Storage failures carry operation and model context.

use crate::db::DbError;
use crate::model::{Record, RecordError, Value};
use crate::query::QueryError;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod executor;
pub mod policy;

pub use executor::{Engine, EngineOptions};
pub use policy::{ConflictPolicy, ConflictResolution, DeleteMode};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug)]
pub enum EngineError {
    Query(QueryError),
    Record(RecordError),
    /// Uniqueness, NOT NULL or foreign-key rule rejected a write.
    ConstraintViolation {
        op: &'static str,
        model: String,
        message: String,
    },
    /// Update/delete/restore without conditions and without opt-in.
    UnsafeBulkOperation { op: &'static str, model: String },
    NotFound { model: String },
    /// Record-level operation on a record that was never stored.
    NotPersisted { model: String },
    Execution {
        op: &'static str,
        model: String,
        source: DbError,
    },
    /// A batch insert failed at `failed_index`; the whole batch rolled back.
    BatchAborted {
        model: String,
        failed_index: usize,
        total: usize,
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::ConstraintViolation { .. } => true,
            Self::BatchAborted { source, .. } => source.is_constraint_violation(),
            _ => false,
        }
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(err) => write!(f, "{err}"),
            Self::Record(err) => write!(f, "{err}"),
            Self::ConstraintViolation { op, model, message } => {
                write!(f, "{op} on `{model}` violated a constraint: {message}")
            }
            Self::UnsafeBulkOperation { op, model } => write!(
                f,
                "refusing {op} on every `{model}` row without conditions; use allow_global()"
            ),
            Self::NotFound { model } => write!(f, "no `{model}` record found"),
            Self::NotPersisted { model } => {
                write!(f, "`{model}` record has not been persisted")
            }
            Self::Execution { op, model, source } => {
                write!(f, "{op} on `{model}` failed: {source}")
            }
            Self::BatchAborted {
                model,
                failed_index,
                total,
                source,
            } => write!(
                f,
                "batch insert of {total} `{model}` record(s) aborted at index {failed_index}: {source}"
            ),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Query(err) => Some(err),
            Self::Record(err) => Some(err),
            Self::Execution { source, .. } => Some(source),
            Self::BatchAborted { source, .. } => Some(source.as_ref()),
            Self::ConstraintViolation { .. }
            | Self::UnsafeBulkOperation { .. }
            | Self::NotFound { .. }
            | Self::NotPersisted { .. } => None,
        }
    }
}

impl From<QueryError> for EngineError {
    fn from(value: QueryError) -> Self {
        Self::Query(value)
    }
}

impl From<RecordError> for EngineError {
    fn from(value: RecordError) -> Self {
        Self::Record(value)
    }
}

/// Per-record insert result.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Inserted { primary_key: Value },
    /// Inserted, or merged into the conflicting row.
    Upserted { primary_key: Value },
    /// Conflict ignored; nothing was written.
    Skipped,
    /// Only reported when the batch continues on error.
    Failed { message: String },
}

impl RecordOutcome {
    pub fn primary_key(&self) -> Option<&Value> {
        match self {
            Self::Inserted { primary_key } | Self::Upserted { primary_key } => Some(primary_key),
            Self::Skipped | Self::Failed { .. } => None,
        }
    }
}

/// Insert results, one entry per input record, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchOutcome {
    /// Records written (inserted or merged).
    pub fn written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.primary_key().is_some())
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, RecordOutcome::Skipped))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, RecordOutcome::Failed { .. }))
            .count()
    }
}

/// Result of [`Engine::execute`], shaped by the plan's operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Records(Vec<Record>),
    Record(Record),
    Scalar(Value),
    Rows(Vec<BTreeMap<String, Value>>),
    Inserted {
        records: Vec<Record>,
        outcome: BatchOutcome,
    },
    Affected(usize),
}
