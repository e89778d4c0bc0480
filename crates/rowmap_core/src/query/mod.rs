//! Query builder: conditions, plans, scopes and SQL rendering.
//!
//! # Responsibility
//! - Compose immutable condition trees and query plan snapshots.
//! - Render plans into SQLite statements with positional params.
//!
//! # Invariants
//! - Builder methods never mutate the receiver; each returns a new plan.
//! - Field names resolve case-insensitively against the model descriptor;
//!   unknown names fail before any statement reaches storage.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod condition;
pub mod plan;
pub mod scope;
pub mod sql;

pub use condition::{CompareOp, Condition};
pub use plan::{
    AggregateFn, Assignment, Assignments, DeleteOp, Direction, Fetch, InsertOp, InsertOptions,
    Operation, OperationKind, OrderTerm, QueryPlan, SelectItem, UpdateOp,
};
pub use scope::{ScopeError, ScopeFn, ScopeRegistry};

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// `select` and `omit` were both given.
    ProjectionConflict,
    UnknownField {
        model: String,
        field: String,
    },
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    /// Raw text placeholders do not match the number of params.
    PlaceholderMismatch {
        sql: String,
        placeholders: usize,
        params: usize,
    },
    /// Embedded fragment uses `?NNN` or a named parameter, which cannot be
    /// renumbered once spliced into a larger statement.
    FragmentPlaceholder(String),
    InvalidOrder(String),
    InvalidSelect(String),
    /// Assignment targets a field that must not change (primary key).
    ImmutableField(String),
    /// Update plan without any assignment.
    EmptyUpdate,
    /// Operation needs a descriptor role the model lacks.
    Unsupported(String),
    Serialization(String),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProjectionConflict => {
                write!(f, "select and omit cannot be used on the same plan")
            }
            Self::UnknownField { model, field } => {
                write!(f, "model `{model}` has no field `{field}`")
            }
            Self::TypeMismatch {
                field,
                expected,
                actual,
            } => write!(f, "field `{field}` expects {expected}, got {actual}"),
            Self::PlaceholderMismatch {
                sql,
                placeholders,
                params,
            } => write!(
                f,
                "`{sql}` has {placeholders} placeholder(s) but {params} param(s)"
            ),
            Self::FragmentPlaceholder(sql) => {
                write!(f, "`{sql}` must use anonymous `?` placeholders")
            }
            Self::InvalidOrder(clause) => write!(f, "invalid order clause `{clause}`"),
            Self::InvalidSelect(message) => write!(f, "invalid select: {message}"),
            Self::ImmutableField(field) => write!(f, "field `{field}` cannot be assigned"),
            Self::EmptyUpdate => write!(f, "update has no assignments"),
            Self::Unsupported(message) => write!(f, "unsupported operation: {message}"),
            Self::Serialization(message) => write!(f, "typed conversion failed: {message}"),
        }
    }
}

impl Error for QueryError {}
