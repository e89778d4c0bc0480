//! Conversion between records and caller-defined serde types.
//!
//! Keys are model field names; a typed struct may carry only a subset of
//! the model's fields (narrow read models).

use crate::model::{FieldDescriptor, FieldRole, FieldType, ModelDescriptor, Record, Value};
use crate::query::{QueryError, QueryResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Deserializes `record` into `T`.
///
/// The primary key and soft-delete marker are exposed under their field
/// names alongside the regular values.
pub fn to_typed<T: DeserializeOwned>(model: &ModelDescriptor, record: &Record) -> QueryResult<T> {
    let mut object = Map::new();
    let primary_key = model.primary_key();
    object.insert(
        primary_key.name.clone(),
        to_json(record.primary_key().unwrap_or(&Value::Null))?,
    );
    if let Some(field) = model.soft_delete_field() {
        let marker = record.deleted_at().map_or(Value::Null, Value::Integer);
        object.insert(field.name.clone(), to_json(&marker)?);
    }
    for (key, value) in record.values() {
        let name = model
            .field(key)
            .map_or_else(|| key.clone(), |field| field.name.clone());
        object.insert(name, to_json(value)?);
    }
    serde_json::from_value(JsonValue::Object(object))
        .map_err(|err| QueryError::Serialization(err.to_string()))
}

/// Serializes `value` into a record for `model`.
///
/// A non-zero primary key yields a persisted record (the value describes an
/// existing row); otherwise the record is unpersisted.
pub fn from_typed<T: Serialize>(model: &ModelDescriptor, value: &T) -> QueryResult<Record> {
    let object = match serde_json::to_value(value) {
        Ok(JsonValue::Object(object)) => object,
        Ok(other) => {
            return Err(QueryError::Serialization(format!(
                "expected a struct or map, got {}",
                json_kind(&other)
            )))
        }
        Err(err) => return Err(QueryError::Serialization(err.to_string())),
    };

    let mut primary_key = None;
    let mut deleted_at = None;
    let mut values = BTreeMap::new();
    for (key, json) in object {
        let field = model.field(&key).ok_or_else(|| QueryError::UnknownField {
            model: model.name().to_string(),
            field: key.clone(),
        })?;
        let value = from_json(field, json)?;
        match field.role {
            FieldRole::PrimaryKey(_) => primary_key = (!value.is_zero()).then_some(value),
            FieldRole::SoftDelete => deleted_at = value.as_i64(),
            _ => {
                values.insert(field.name.clone(), value);
            }
        }
    }

    Ok(match primary_key {
        Some(key) => Record::from_storage(Some(key), values, deleted_at),
        None => Record::from_pairs(values),
    })
}

fn to_json(value: &Value) -> QueryResult<JsonValue> {
    serde_json::to_value(value).map_err(|err| QueryError::Serialization(err.to_string()))
}

fn from_json(field: &FieldDescriptor, json: JsonValue) -> QueryResult<Value> {
    let mismatch = |json: &JsonValue| QueryError::TypeMismatch {
        field: field.name.clone(),
        expected: field.ty.label(),
        actual: json_kind(json),
    };
    match json {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(flag) => Ok(Value::Bool(flag)),
        JsonValue::Number(number) => {
            if field.ty == FieldType::Real {
                return number
                    .as_f64()
                    .map(Value::Real)
                    .ok_or_else(|| mismatch(&JsonValue::Number(number.clone())));
            }
            match (number.as_i64(), number.as_f64()) {
                (Some(integer), _) => Ok(Value::Integer(integer)),
                (None, Some(real)) => Ok(Value::Real(real)),
                (None, None) => Err(mismatch(&JsonValue::Number(number))),
            }
        }
        JsonValue::String(text) => Ok(Value::Text(text)),
        JsonValue::Array(items) if field.ty == FieldType::Blob => {
            let mut bytes = Vec::with_capacity(items.len());
            for item in &items {
                let byte = item
                    .as_u64()
                    .and_then(|byte| u8::try_from(byte).ok())
                    .ok_or_else(|| mismatch(item))?;
                bytes.push(byte);
            }
            Ok(Value::Blob(bytes))
        }
        other => Err(mismatch(&other)),
    }
}

fn json_kind(json: &JsonValue) -> &'static str {
    match json {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "text",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
