//! Core of the rowmap data-access layer.
//! Model descriptors, query plans and the execution engine over SQLite.

pub mod config;
pub mod db;
pub mod engine;
pub mod logging;
pub mod mapper;
pub mod model;
pub mod query;
pub mod schema;

pub use config::{ConfigError, LoggingConfig, StoreConfig};
pub use db::{DbError, DbResult, LockMode, RowSet, SqliteStorage, Statement, Storage};
pub use engine::{
    BatchOutcome, ConflictPolicy, Engine, EngineError, EngineOptions, EngineResult,
    ExecutionResult, RecordOutcome,
};
pub use logging::{default_log_level, init_logging, logging_status};
pub use mapper::{from_typed, to_typed};
pub use model::{
    FieldDescriptor, FieldRole, FieldType, ForeignKey, ModelDescriptor, PrimaryKeyKind, Record,
    RecordError, RecordState, Value,
};
pub use query::{
    AggregateFn, Assignments, Condition, DeleteOp, Direction, Fetch, InsertOptions, QueryError,
    QueryPlan, QueryResult, ScopeRegistry, SelectItem,
};
pub use schema::{ReconcileReport, SchemaError, SchemaRegistry};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
