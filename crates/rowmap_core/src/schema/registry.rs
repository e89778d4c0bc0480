//! Descriptor registry and live-schema reconciliation.

use super::{SchemaError, SchemaResult};
use crate::db::{ColumnInfo, Statement, Storage};
use crate::model::{FieldDescriptor, FieldRole, FieldType, ModelDescriptor, PrimaryKeyKind, Value};
use crate::query::sql::quote_ident;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Registered model descriptors keyed by model name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    models: BTreeMap<String, Arc<ModelDescriptor>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records or replaces the descriptor for its model name.
    pub fn register(&mut self, descriptor: ModelDescriptor) -> Arc<ModelDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.models
            .insert(descriptor.name().to_string(), Arc::clone(&descriptor));
        descriptor
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.models.get(name).cloned()
    }

    /// Like [`Self::get`] but reports unknown names as errors.
    pub fn model(&self, name: &str) -> SchemaResult<Arc<ModelDescriptor>> {
        self.get(name)
            .ok_or_else(|| SchemaError::UnknownModel(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Sorted registered model names.
    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Reconciles one registered model against the live store.
    pub fn reconcile<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        name: &str,
    ) -> SchemaResult<ReconcileReport> {
        let model = self.model(name)?;
        reconcile_model(storage, &model)
    }

    /// Reconciles every registered model, in name order.
    pub fn reconcile_all<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
    ) -> SchemaResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for model in self.models.values() {
            report.merge(reconcile_model(storage, model)?);
        }
        Ok(report)
    }
}

/// Structural changes applied by one reconcile call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created_tables: Vec<String>,
    /// `(table, column)` pairs.
    pub added_columns: Vec<(String, String)>,
    pub created_indexes: Vec<String>,
}

impl ReconcileReport {
    /// Returns whether no DDL was issued.
    pub fn is_noop(&self) -> bool {
        self.created_tables.is_empty()
            && self.added_columns.is_empty()
            && self.created_indexes.is_empty()
    }

    fn merge(&mut self, other: ReconcileReport) {
        self.created_tables.extend(other.created_tables);
        self.added_columns.extend(other.added_columns);
        self.created_indexes.extend(other.created_indexes);
    }
}

/// Brings `model`'s table in line with its descriptor using additive DDL.
///
/// # Errors
/// - `Conflict` when a live column's affinity cannot hold the declared type.
/// - `MissingPrimaryKey` when the table exists without the key column.
/// - `Db` when introspection or DDL execution fails. DDL is rolled back unless
///   a caller's transaction is open, in which case the caller decides.
pub fn reconcile_model<S: Storage + ?Sized>(
    storage: &mut S,
    model: &ModelDescriptor,
) -> SchemaResult<ReconcileReport> {
    let started_at = Instant::now();
    let live = storage.list_columns(model.table())?;
    let mut report = ReconcileReport::default();
    let mut ddl = Vec::new();

    if live.is_empty() {
        ddl.push(create_table_sql(model));
        report.created_tables.push(model.table().to_string());
        for field in model.fields().iter().filter(|field| needs_index(field)) {
            let (name, sql) = create_index_sql(model, field);
            ddl.push(sql);
            report.created_indexes.push(name);
        }
    } else {
        let indexes = storage.list_indexes(model.table())?;
        for field in model.fields() {
            match find_column(&live, &field.column) {
                Some(column) => {
                    check_compatible(model, field, column)?;
                    if needs_index(field) {
                        let (name, sql) = create_index_sql(model, field);
                        if !indexes.iter().any(|index| index.eq_ignore_ascii_case(&name)) {
                            ddl.push(sql);
                            report.created_indexes.push(name);
                        }
                    }
                }
                None if field.is_primary_key() => {
                    return Err(SchemaError::MissingPrimaryKey {
                        table: model.table().to_string(),
                        column: field.column.clone(),
                    });
                }
                None => {
                    ddl.push(add_column_sql(model, field));
                    report
                        .added_columns
                        .push((model.table().to_string(), field.column.clone()));
                    if needs_index(field) {
                        let (name, sql) = create_index_sql(model, field);
                        ddl.push(sql);
                        report.created_indexes.push(name);
                    }
                }
            }
        }
    }

    if ddl.is_empty() {
        return Ok(report);
    }

    // Inside a caller's transaction the DDL joins that unit instead.
    let owns_transaction = !storage.in_transaction();
    if owns_transaction {
        storage.begin_transaction()?;
    }
    for sql in &ddl {
        if let Err(err) = storage.execute(&Statement::new(sql.as_str(), Vec::new())) {
            error!(
                "event=schema_reconcile module=schema status=error model={} duration_ms={} error={}",
                model.name(),
                started_at.elapsed().as_millis(),
                err
            );
            if owns_transaction {
                storage.rollback()?;
            }
            return Err(err.into());
        }
    }
    if owns_transaction {
        storage.commit()?;
    }

    info!(
        "event=schema_reconcile module=schema status=ok model={} created_tables={} added_columns={} created_indexes={} duration_ms={}",
        model.name(),
        report.created_tables.len(),
        report.added_columns.len(),
        report.created_indexes.len(),
        started_at.elapsed().as_millis()
    );
    Ok(report)
}

fn find_column<'a>(live: &'a [ColumnInfo], column: &str) -> Option<&'a ColumnInfo> {
    live.iter()
        .find(|info| info.name.eq_ignore_ascii_case(column))
}

fn needs_index(field: &FieldDescriptor) -> bool {
    !field.is_primary_key() && (field.unique || field.is_soft_delete())
}

fn create_table_sql(model: &ModelDescriptor) -> String {
    let columns = model
        .fields()
        .iter()
        .map(|field| column_definition(field, true))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({columns});", quote_ident(model.table()))
}

fn add_column_sql(model: &ModelDescriptor, field: &FieldDescriptor) -> String {
    if !field.nullable && field.default.is_none() {
        warn!(
            "event=schema_reconcile module=schema status=degraded model={} column={} reason=not_null_without_default",
            model.name(),
            field.column
        );
    }
    format!(
        "ALTER TABLE {} ADD COLUMN {};",
        quote_ident(model.table()),
        column_definition(field, false)
    )
}

fn column_definition(field: &FieldDescriptor, new_table: bool) -> String {
    let mut definition = format!("{} {}", quote_ident(&field.column), field.ty.sql_type());
    match field.role {
        FieldRole::PrimaryKey(PrimaryKeyKind::AutoIncrement) => {
            definition.push_str(" PRIMARY KEY AUTOINCREMENT");
            return definition;
        }
        FieldRole::PrimaryKey(PrimaryKeyKind::Uuid) => {
            definition.push_str(" PRIMARY KEY NOT NULL");
            return definition;
        }
        _ => {}
    }

    // SQLite rejects ADD COLUMN ... NOT NULL without a default.
    if !field.nullable && (new_table || field.default.is_some()) {
        definition.push_str(" NOT NULL");
    }
    if let Some(default) = &field.default {
        definition.push_str(" DEFAULT ");
        definition.push_str(&sql_literal(default));
    }
    if let Some(target) = &field.references {
        definition.push_str(&format!(
            " REFERENCES {} ({})",
            quote_ident(&target.table),
            quote_ident(&target.column)
        ));
    }
    definition
}

fn create_index_sql(model: &ModelDescriptor, field: &FieldDescriptor) -> (String, String) {
    let name = format!("idx_{}_{}", model.table(), field.column);
    let kind = if field.unique { "UNIQUE INDEX" } else { "INDEX" };
    let sql = format!(
        "CREATE {kind} IF NOT EXISTS {} ON {} ({});",
        quote_ident(&name),
        quote_ident(model.table()),
        quote_ident(&field.column)
    );
    (name, sql)
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(value) => i64::from(*value).to_string(),
        Value::Integer(value) => value.to_string(),
        Value::Real(value) => format!("{value:?}"),
        Value::Text(value) => format!("'{}'", value.replace('\'', "''")),
        Value::Blob(bytes) => {
            let hex: String = bytes.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("X'{hex}'")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

/// SQLite column affinity rules for a declared type.
fn affinity_of(declared: &str) -> Affinity {
    let upper = declared.to_ascii_uppercase();
    if upper.contains("INT") {
        Affinity::Integer
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        Affinity::Text
    } else if upper.is_empty() || upper.contains("BLOB") {
        Affinity::Blob
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        Affinity::Real
    } else {
        Affinity::Numeric
    }
}

fn check_compatible(
    model: &ModelDescriptor,
    field: &FieldDescriptor,
    column: &ColumnInfo,
) -> SchemaResult<()> {
    let affinity = affinity_of(&column.declared_type);
    let compatible = match field.ty {
        FieldType::Integer | FieldType::Boolean | FieldType::Timestamp => {
            matches!(affinity, Affinity::Integer | Affinity::Numeric)
        }
        FieldType::Real => matches!(affinity, Affinity::Real | Affinity::Numeric),
        FieldType::Text => matches!(affinity, Affinity::Text | Affinity::Blob),
        FieldType::Blob => affinity == Affinity::Blob,
    };
    if compatible {
        return Ok(());
    }
    Err(SchemaError::Conflict {
        table: model.table().to_string(),
        column: column.name.clone(),
        existing: column.declared_type.clone(),
        declared: field.ty.label(),
    })
}
