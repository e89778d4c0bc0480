use rowmap_core::db::{ColumnInfo, DbResult, RowSet, Statement, Storage};
use rowmap_core::query::DeleteOp;
use rowmap_core::{
    Assignments, Condition, Engine, EngineError, EngineOptions, ExecutionResult, FieldDescriptor,
    FieldType, ModelDescriptor, QueryPlan, StoreConfig,
};
use std::sync::Arc;

#[test]
fn unconditioned_mutations_never_reach_storage() {
    let mut storage = RecordingStorage::default();
    let engine = Engine::default();
    let plan = plan();

    let err = engine
        .update(&mut storage, &plan, Assignments::new().set("name", "hello"))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnsafeBulkOperation { op: "update", .. }
    ));
    let err = engine
        .update_columns(&mut storage, &plan, Assignments::new().set("age", 1))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsafeBulkOperation { .. }));
    let err = engine.delete(&mut storage, &plan).unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnsafeBulkOperation { op: "delete", .. }
    ));
    let err = engine.delete_permanently(&mut storage, &plan).unwrap_err();
    assert!(matches!(err, EngineError::UnsafeBulkOperation { .. }));
    let err = engine.restore(&mut storage, &plan).unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnsafeBulkOperation { op: "restore", .. }
    ));

    assert!(storage.statements.is_empty());
    assert_eq!(storage.transactions, 0);
}

#[test]
fn execute_applies_the_same_gate() {
    let mut storage = RecordingStorage::default();
    let engine = Engine::default();
    let plan = plan();

    let err = engine
        .execute(
            &mut storage,
            &plan.update(Assignments::new().set("name", "x")),
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsafeBulkOperation { .. }));
    let err = engine
        .execute(&mut storage, &plan.delete(DeleteOp { permanent: true }))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsafeBulkOperation { .. }));
    assert!(storage.statements.is_empty());
}

#[test]
fn trivially_true_conditions_do_not_count_as_restrictions() {
    let mut storage = RecordingStorage::default();
    let engine = Engine::default();
    let plan = plan().filter(Condition::all(Vec::new()));

    let err = engine.delete(&mut storage, &plan).unwrap_err();
    assert!(matches!(err, EngineError::UnsafeBulkOperation { .. }));
    assert!(storage.statements.is_empty());
}

#[test]
fn allow_global_opts_in_per_plan() {
    let mut storage = RecordingStorage::with_affected(3);
    let engine = Engine::default();

    let affected = engine
        .update(
            &mut storage,
            &plan().allow_global(),
            Assignments::new().set("name", "hello"),
        )
        .unwrap();
    assert_eq!(affected, 3);
    assert_eq!(storage.statements.len(), 1);
    let sql = &storage.statements[0].sql;
    assert!(sql.starts_with("UPDATE \"users\" SET"));
    assert!(sql.contains("\"deleted_at\" IS NULL"));
}

#[test]
fn engine_options_allow_global_mutation() {
    let mut storage = RecordingStorage::with_affected(2);
    let engine = Engine::new(EngineOptions {
        allow_global_mutation: true,
    });

    let result = engine
        .execute(&mut storage, &plan().delete(DeleteOp { permanent: true }))
        .unwrap();
    assert_eq!(result, ExecutionResult::Affected(2));
    assert_eq!(storage.statements[0].sql, "DELETE FROM \"users\"");
    assert!(storage.statements[0].params.is_empty());
}

#[test]
fn config_flag_carries_into_engine_options() {
    let config = StoreConfig {
        allow_global_mutation: true,
        ..StoreConfig::default()
    };
    assert!(Engine::from_config(&config).options().allow_global_mutation);
    assert!(!Engine::default().options().allow_global_mutation);
}

#[test]
fn conditioned_mutations_pass_the_gate() {
    let mut storage = RecordingStorage::with_affected(1);
    let engine = Engine::default();

    let affected = engine
        .delete(&mut storage, &plan().filter(Condition::gt("age", 20)))
        .unwrap();
    assert_eq!(affected, 1);
    let affected = engine.restore(&mut storage, &plan().target(7)).unwrap();
    assert_eq!(affected, 1);
    assert_eq!(storage.statements.len(), 2);
}

#[derive(Default)]
struct RecordingStorage {
    statements: Vec<Statement>,
    affected: usize,
    transactions: usize,
    in_transaction: bool,
}

impl RecordingStorage {
    fn with_affected(affected: usize) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }
}

impl Storage for RecordingStorage {
    fn execute(&mut self, statement: &Statement) -> DbResult<RowSet> {
        self.statements.push(statement.clone());
        Ok(RowSet {
            rows_affected: self.affected,
            ..RowSet::default()
        })
    }

    fn begin_transaction(&mut self) -> DbResult<()> {
        self.transactions += 1;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn list_columns(&mut self, _table: &str) -> DbResult<Vec<ColumnInfo>> {
        Ok(Vec::new())
    }

    fn list_indexes(&mut self, _table: &str) -> DbResult<Vec<String>> {
        Ok(Vec::new())
    }
}

fn plan() -> QueryPlan {
    QueryPlan::new(Arc::new(
        ModelDescriptor::builder("User")
            .standard_fields()
            .field(FieldDescriptor::new("name", FieldType::Text))
            .field(FieldDescriptor::new("age", FieldType::Integer))
            .build()
            .unwrap(),
    ))
}
