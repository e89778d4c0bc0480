//! Record/row mapping.
//!
//! # Responsibility
//! - Turn records into insertable column values, applying defaults,
//!   timestamps and generated keys.
//! - Turn fetched rows back into persisted records.
//!
//! # Invariants
//! - Unknown record keys are rejected, never silently dropped on write.
//! - Unknown row columns are ignored on read (aggregates, raw joins).

use crate::db::RowSet;
use crate::model::{
    FieldDescriptor, FieldRole, ModelDescriptor, PrimaryKeyKind, Record, Value,
};
use crate::query::sql::check_type;
use crate::query::{QueryError, QueryResult};
use std::collections::BTreeMap;
use uuid::Uuid;

mod typed;

pub use typed::{from_typed, to_typed};

/// Fields covered by a `select`/`omit` projection, in declaration order.
///
/// # Errors
/// - `ProjectionConflict` when both lists are given.
/// - `UnknownField` for names the model does not declare.
pub fn selected_fields<'m>(
    model: &'m ModelDescriptor,
    select: Option<&[String]>,
    omit: Option<&[String]>,
) -> QueryResult<Vec<&'m FieldDescriptor>> {
    let resolve = |names: &[String]| -> QueryResult<Vec<&'m FieldDescriptor>> {
        names
            .iter()
            .map(|name| {
                model.field(name).ok_or_else(|| QueryError::UnknownField {
                    model: model.name().to_string(),
                    field: name.clone(),
                })
            })
            .collect()
    };

    match (select, omit) {
        (Some(_), Some(_)) => Err(QueryError::ProjectionConflict),
        (Some(names), None) => {
            let chosen = resolve(names)?;
            Ok(model
                .fields()
                .iter()
                .filter(|field| chosen.iter().any(|picked| std::ptr::eq(*picked, *field)))
                .collect())
        }
        (None, Some(names)) => {
            let dropped = resolve(names)?;
            Ok(model
                .fields()
                .iter()
                .filter(|field| !dropped.iter().any(|skip| std::ptr::eq(*skip, *field)))
                .collect())
        }
        (None, None) => Ok(model.fields().iter().collect()),
    }
}

/// Column values to insert for `record`.
///
/// Fields outside `projection` are skipped unless they declare a default.
/// Zero values take the declared default; zero created/updated stamps take
/// `now`; an unset UUID key is generated; an unset auto key is left to
/// storage.
pub fn to_row<'m>(
    model: &'m ModelDescriptor,
    record: &Record,
    projection: &[&'m FieldDescriptor],
    now: i64,
) -> QueryResult<Vec<(&'m FieldDescriptor, Value)>> {
    for (key, value) in record.values() {
        let field = model.field(key).ok_or_else(|| QueryError::UnknownField {
            model: model.name().to_string(),
            field: key.clone(),
        })?;
        check_type(field, value)?;
    }

    let mut row = Vec::with_capacity(model.fields().len());
    for field in model.fields() {
        let stored = record.get(&field.name).cloned().unwrap_or(Value::Null);
        let included = projection
            .iter()
            .any(|picked| std::ptr::eq(*picked, field));

        let value = match field.role {
            FieldRole::PrimaryKey(kind) => {
                let key = record.primary_key().cloned().unwrap_or(stored);
                if !key.is_zero() {
                    check_type(field, &key)?;
                    Some(key)
                } else if kind == PrimaryKeyKind::Uuid {
                    Some(Value::Text(Uuid::new_v4().to_string()))
                } else {
                    None
                }
            }
            FieldRole::SoftDelete => record
                .deleted_at()
                .map(Value::Integer)
                .or_else(|| (!stored.is_null()).then_some(stored))
                .filter(|_| included),
            FieldRole::CreatedAt | FieldRole::UpdatedAt if included => Some(if stored.is_zero() {
                Value::Integer(now)
            } else {
                stored
            }),
            _ if included => Some(match &field.default {
                Some(default) if stored.is_zero() => default.clone(),
                _ => stored,
            }),
            _ => field.default.clone(),
        };
        if let Some(value) = value {
            row.push((field, value));
        }
    }
    Ok(row)
}

/// Rebuilds a persisted record from one fetched row.
pub fn from_row(model: &ModelDescriptor, columns: &[String], row: &[Value]) -> QueryResult<Record> {
    let mut primary_key = None;
    let mut deleted_at = None;
    let mut values = BTreeMap::new();

    for (column, raw) in columns.iter().zip(row) {
        let Some(field) = model.field_by_column(column) else {
            continue;
        };
        let value = raw
            .clone()
            .coerce(field.ty)
            .ok_or_else(|| QueryError::TypeMismatch {
                field: field.name.clone(),
                expected: field.ty.label(),
                actual: raw.kind(),
            })?;
        match field.role {
            FieldRole::PrimaryKey(_) => primary_key = (!value.is_null()).then_some(value),
            FieldRole::SoftDelete => deleted_at = value.as_i64(),
            _ => {
                values.insert(field.name.clone(), value);
            }
        }
    }
    Ok(Record::from_storage(primary_key, values, deleted_at))
}

/// Maps every row of `rows` to a record.
pub fn records_from_rows(model: &ModelDescriptor, rows: &RowSet) -> QueryResult<Vec<Record>> {
    rows.rows
        .iter()
        .map(|row| from_row(model, &rows.columns, row))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{from_row, selected_fields, to_row};
    use crate::model::{FieldDescriptor, FieldType, ModelDescriptor, Record, RecordState, Value};
    use crate::query::QueryError;

    fn user() -> ModelDescriptor {
        ModelDescriptor::builder("User")
            .standard_fields()
            .field(FieldDescriptor::new("name", FieldType::Text))
            .field(FieldDescriptor::new("age", FieldType::Integer).default_value(18))
            .field(FieldDescriptor::new("active", FieldType::Boolean))
            .build()
            .unwrap()
    }

    fn names(row: &[(&FieldDescriptor, Value)]) -> Vec<String> {
        row.iter().map(|(field, _)| field.name.clone()).collect()
    }

    #[test]
    fn projection_respects_select_and_omit() {
        let model = user();
        let select = ["Age".to_string(), "name".to_string()];
        let picked = selected_fields(&model, Some(&select), None).unwrap();
        assert_eq!(
            picked.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["name", "age"]
        );

        let kept = selected_fields(&model, None, Some(&["age".to_string()])).unwrap();
        assert!(kept.iter().all(|field| field.name != "age"));

        let err = selected_fields(&model, None, Some(&["missing".to_string()])).unwrap_err();
        assert!(matches!(err, QueryError::UnknownField { .. }));
    }

    #[test]
    fn to_row_applies_defaults_and_timestamps() {
        let model = user();
        let all = selected_fields(&model, None, None).unwrap();
        let record = Record::new().with("name", "jinzhu").with("age", 0);
        let row = to_row(&model, &record, &all, 42).unwrap();

        assert_eq!(
            names(&row),
            vec!["created_at", "updated_at", "name", "age", "active"]
        );
        assert_eq!(row[0].1, Value::Integer(42));
        assert_eq!(row[3].1, Value::Integer(18));
        assert_eq!(row[4].1, Value::Null);
    }

    #[test]
    fn omitted_fields_keep_declared_defaults() {
        let model = user();
        let omit = ["age".to_string(), "created_at".to_string()];
        let projection = selected_fields(&model, None, Some(&omit)).unwrap();
        let record = Record::new().with("name", "jinzhu").with("age", 30);
        let row = to_row(&model, &record, &projection, 7).unwrap();
        assert_eq!(names(&row), vec!["updated_at", "name", "age", "active"]);
        assert_eq!(row[2].1, Value::Integer(18));
    }

    #[test]
    fn to_row_rejects_unknown_keys_and_bad_types() {
        let model = user();
        let all = selected_fields(&model, None, None).unwrap();

        let err = to_row(&model, &Record::new().with("nickname", "j"), &all, 0).unwrap_err();
        assert!(matches!(err, QueryError::UnknownField { field, .. } if field == "nickname"));

        let err = to_row(&model, &Record::new().with("age", "old"), &all, 0).unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { .. }));
    }

    #[test]
    fn uuid_keys_are_generated() {
        let model = ModelDescriptor::builder("Token")
            .field(FieldDescriptor::uuid_key("id"))
            .field(FieldDescriptor::new("label", FieldType::Text))
            .build()
            .unwrap();
        let all = selected_fields(&model, None, None).unwrap();
        let row = to_row(&model, &Record::new().with("label", "a"), &all, 0).unwrap();
        let key = row[0].1.as_str().unwrap();
        assert_eq!(key.len(), 36);
    }

    #[test]
    fn from_row_restores_roles_and_types() {
        let model = user();
        let columns: Vec<String> = ["id", "deleted_at", "name", "active", "total"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let row = vec![
            Value::Integer(3),
            Value::Integer(99),
            Value::from("jinzhu"),
            Value::Integer(1),
            Value::Integer(10),
        ];
        let record = from_row(&model, &columns, &row).unwrap();
        assert_eq!(record.primary_key(), Some(&Value::Integer(3)));
        assert_eq!(record.deleted_at(), Some(99));
        assert_eq!(record.state(), RecordState::SoftDeleted);
        assert_eq!(record.get_bool("active"), Some(true));
        assert!(record.get("total").is_none());
    }
}
