//! Record: one data instance mapped to a table row.
//!
//! # Responsibility
//! - Hold primary key, field values and the soft-delete marker.
//! - Track lifecycle state across insert/delete/restore.
//!
//! # Invariants
//! - A primary key, once assigned, never changes.
//! - `Removed` is terminal and reachable only from a persisted state.
//! - `deleted_at.is_some()` iff state is `SoftDeleted`.

use super::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Built by the caller, not yet inserted.
    Unpersisted,
    /// Persisted and visible to default reads.
    Active,
    /// Persisted with the soft-delete marker set.
    SoftDeleted,
    /// Physically removed by a permanent delete.
    Removed,
}

impl RecordState {
    pub fn is_persisted(self) -> bool {
        matches!(self, Self::Active | Self::SoftDeleted)
    }
}

impl Display for RecordState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unpersisted => "unpersisted",
            Self::Active => "active",
            Self::SoftDeleted => "soft_deleted",
            Self::Removed => "removed",
        };
        write!(f, "{label}")
    }
}

/// Record-level invariant violations.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordError {
    PrimaryKeyImmutable { existing: Value, attempted: Value },
    InvalidTransition { from: RecordState, to: RecordState },
}

impl Display for RecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryKeyImmutable {
                existing,
                attempted,
            } => write!(
                f,
                "primary key is immutable: already {existing}, attempted {attempted}"
            ),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid record transition {from} -> {to}")
            }
        }
    }
}

impl Error for RecordError {}

/// One typed data instance.
///
/// Field keys are model field names; lookups fall back to a
/// case-insensitive match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    primary_key: Option<Value>,
    values: BTreeMap<String, Value>,
    deleted_at: Option<i64>,
    state: RecordState,
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl Record {
    /// Creates an empty unpersisted record.
    pub fn new() -> Self {
        Self {
            primary_key: None,
            values: BTreeMap::new(),
            deleted_at: None,
            state: RecordState::Unpersisted,
        }
    }

    /// Builds an unpersisted record from `(field, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut record = Self::new();
        for (key, value) in pairs {
            record.values.insert(key.into(), value.into());
        }
        record
    }

    /// Builder-style setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Sets one field value, replacing any entry that differs only by case.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let field = field.into();
        if let Some(existing) = self.key_for(&field).map(str::to_string) {
            self.values.remove(&existing);
        }
        self.values.insert(field, value.into());
        self
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        let key = self.key_for(field)?.to_string();
        self.values.remove(&key)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.key_for(field).and_then(|key| self.values.get(key))
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn primary_key(&self) -> Option<&Value> {
        self.primary_key.as_ref()
    }

    /// Assigns the primary key.
    ///
    /// Re-assigning the same value is a no-op; a different value fails.
    pub fn assign_primary_key(&mut self, value: impl Into<Value>) -> Result<(), RecordError> {
        let value = value.into();
        match &self.primary_key {
            Some(existing) if *existing != value => Err(RecordError::PrimaryKeyImmutable {
                existing: existing.clone(),
                attempted: value,
            }),
            Some(_) => Ok(()),
            None => {
                self.primary_key = Some(value);
                Ok(())
            }
        }
    }

    /// Soft-delete timestamp in epoch milliseconds, `None` when active.
    pub fn deleted_at(&self) -> Option<i64> {
        self.deleted_at
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Returns whether the record is persisted and not soft-deleted.
    pub fn is_active(&self) -> bool {
        self.state == RecordState::Active
    }

    pub(crate) fn mark_persisted(&mut self, primary_key: Value) -> Result<(), RecordError> {
        if self.state != RecordState::Unpersisted {
            return Err(RecordError::InvalidTransition {
                from: self.state,
                to: RecordState::Active,
            });
        }
        self.assign_primary_key(primary_key)?;
        self.state = RecordState::Active;
        Ok(())
    }

    pub(crate) fn mark_soft_deleted(&mut self, at: i64) -> Result<(), RecordError> {
        match self.state {
            RecordState::Active => {
                self.deleted_at = Some(at);
                self.state = RecordState::SoftDeleted;
                Ok(())
            }
            // Already tombstoned; keep the original timestamp.
            RecordState::SoftDeleted => Ok(()),
            from => Err(RecordError::InvalidTransition {
                from,
                to: RecordState::SoftDeleted,
            }),
        }
    }

    pub(crate) fn mark_restored(&mut self) -> Result<(), RecordError> {
        match self.state {
            RecordState::SoftDeleted | RecordState::Active => {
                self.deleted_at = None;
                self.state = RecordState::Active;
                Ok(())
            }
            from => Err(RecordError::InvalidTransition {
                from,
                to: RecordState::Active,
            }),
        }
    }

    pub(crate) fn mark_removed(&mut self) -> Result<(), RecordError> {
        if !self.state.is_persisted() {
            return Err(RecordError::InvalidTransition {
                from: self.state,
                to: RecordState::Removed,
            });
        }
        self.state = RecordState::Removed;
        Ok(())
    }

    /// Aligns the marker and state with the row storage reports after a write.
    pub(crate) fn sync_deleted_at(
        &mut self,
        deleted_at: Option<i64>,
    ) -> Result<(), RecordError> {
        if !matches!(self.state, RecordState::Active | RecordState::SoftDeleted) {
            return Err(RecordError::InvalidTransition {
                from: self.state,
                to: if deleted_at.is_some() {
                    RecordState::SoftDeleted
                } else {
                    RecordState::Active
                },
            });
        }
        self.deleted_at = deleted_at;
        self.state = if deleted_at.is_some() {
            RecordState::SoftDeleted
        } else {
            RecordState::Active
        };
        Ok(())
    }

    /// Rebuilds a persisted record read back from storage.
    pub(crate) fn from_storage(
        primary_key: Option<Value>,
        values: BTreeMap<String, Value>,
        deleted_at: Option<i64>,
    ) -> Self {
        let state = if deleted_at.is_some() {
            RecordState::SoftDeleted
        } else {
            RecordState::Active
        };
        Self {
            primary_key,
            values,
            deleted_at,
            state,
        }
    }

    fn key_for(&self, field: &str) -> Option<&str> {
        if let Some((key, _)) = self.values.get_key_value(field) {
            return Some(key.as_str());
        }
        self.values
            .keys()
            .find(|key| key.eq_ignore_ascii_case(field))
            .map(String::as_str)
    }
}
