//! Pure decision functions: conflict handling, visibility, delete mode.

use crate::model::{FieldDescriptor, FieldRole, ModelDescriptor};
use crate::query::{Condition, QueryError, QueryResult};

/// What an insert does when it hits a uniqueness conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Surface the conflict as an error.
    #[default]
    Fail,
    /// Leave the existing row untouched and report the record as skipped.
    Ignore,
    /// Overwrite every inserted column except the key and creation stamp.
    UpdateAll,
    /// Overwrite only the named fields.
    UpdateColumns(Vec<String>),
}

/// Storage-level conflict clause derived from a [`ConflictPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    Raise,
    Skip,
    /// Columns to overwrite from the incoming row.
    Merge(Vec<String>),
}

/// Resolves `policy` against the columns an insert writes.
///
/// # Errors
/// - `UnknownField` for an `UpdateColumns` name the model lacks.
/// - `ImmutableField` when `UpdateColumns` names the primary key.
pub fn conflict_resolution(
    policy: &ConflictPolicy,
    model: &ModelDescriptor,
    inserted: &[&FieldDescriptor],
) -> QueryResult<ConflictResolution> {
    match policy {
        ConflictPolicy::Fail => Ok(ConflictResolution::Raise),
        ConflictPolicy::Ignore => Ok(ConflictResolution::Skip),
        ConflictPolicy::UpdateAll => {
            let mut columns: Vec<String> = inserted
                .iter()
                .filter(|field| {
                    !field.is_primary_key() && field.role != FieldRole::CreatedAt
                })
                .map(|field| field.column.clone())
                .collect();
            // Merging into a tombstoned row revives it with the incoming marker.
            if let Some(marker) = model.soft_delete_field() {
                if !columns.contains(&marker.column) {
                    columns.push(marker.column.clone());
                }
            }
            Ok(ConflictResolution::Merge(columns))
        }
        ConflictPolicy::UpdateColumns(names) => {
            let mut columns = Vec::with_capacity(names.len());
            for name in names {
                let field = model.field(name).ok_or_else(|| QueryError::UnknownField {
                    model: model.name().to_string(),
                    field: name.clone(),
                })?;
                if field.is_primary_key() {
                    return Err(QueryError::ImmutableField(field.name.clone()));
                }
                if !columns.contains(&field.column) {
                    columns.push(field.column.clone());
                }
            }
            Ok(ConflictResolution::Merge(columns))
        }
    }
}

/// Filter hiding soft-deleted rows, or `None` when nothing is hidden.
pub fn visibility_condition(model: &ModelDescriptor, include_deleted: bool) -> Option<Condition> {
    if include_deleted {
        return None;
    }
    model
        .soft_delete_field()
        .map(|field| Condition::is_null(field.name.as_str()))
}

/// How a delete is carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteMode {
    /// Stamp the named soft-delete field.
    Logical { field: String },
    Physical,
}

/// Soft-delete capable models delete logically unless `permanent`.
pub fn delete_mode(model: &ModelDescriptor, permanent: bool) -> DeleteMode {
    match model.soft_delete_field() {
        Some(field) if !permanent => DeleteMode::Logical {
            field: field.name.clone(),
        },
        _ => DeleteMode::Physical,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        conflict_resolution, delete_mode, visibility_condition, ConflictPolicy,
        ConflictResolution, DeleteMode,
    };
    use crate::model::{FieldDescriptor, FieldType, ModelDescriptor};
    use crate::query::{Condition, QueryError};

    fn user() -> ModelDescriptor {
        ModelDescriptor::builder("User")
            .standard_fields()
            .field(FieldDescriptor::new("name", FieldType::Text))
            .field(FieldDescriptor::new("age", FieldType::Integer))
            .build()
            .unwrap()
    }

    fn plain() -> ModelDescriptor {
        ModelDescriptor::builder("Tag")
            .field(FieldDescriptor::primary_key("id"))
            .field(FieldDescriptor::new("label", FieldType::Text))
            .build()
            .unwrap()
    }

    #[test]
    fn update_all_skips_key_and_creation_stamp() {
        let model = user();
        let inserted: Vec<_> = model.fields().iter().collect();
        let resolution = conflict_resolution(&ConflictPolicy::UpdateAll, &model, &inserted).unwrap();
        assert_eq!(
            resolution,
            ConflictResolution::Merge(vec![
                "updated_at".to_string(),
                "deleted_at".to_string(),
                "name".to_string(),
                "age".to_string(),
            ])
        );
    }

    #[test]
    fn update_all_always_merges_soft_delete_marker() {
        let model = user();
        let inserted = vec![model.field("name").unwrap()];
        assert_eq!(
            conflict_resolution(&ConflictPolicy::UpdateAll, &model, &inserted).unwrap(),
            ConflictResolution::Merge(vec!["name".to_string(), "deleted_at".to_string()])
        );

        let model = plain();
        let inserted = vec![model.field("label").unwrap()];
        assert_eq!(
            conflict_resolution(&ConflictPolicy::UpdateAll, &model, &inserted).unwrap(),
            ConflictResolution::Merge(vec!["label".to_string()])
        );
    }

    #[test]
    fn update_columns_validates_names() {
        let model = user();
        let policy = ConflictPolicy::UpdateColumns(vec!["Name".to_string(), "name".to_string()]);
        assert_eq!(
            conflict_resolution(&policy, &model, &[]).unwrap(),
            ConflictResolution::Merge(vec!["name".to_string()])
        );

        let policy = ConflictPolicy::UpdateColumns(vec!["id".to_string()]);
        assert_eq!(
            conflict_resolution(&policy, &model, &[]).unwrap_err(),
            QueryError::ImmutableField("id".to_string())
        );
    }

    #[test]
    fn default_policy_fails_on_conflict() {
        assert_eq!(
            conflict_resolution(&ConflictPolicy::default(), &user(), &[]).unwrap(),
            ConflictResolution::Raise
        );
    }

    #[test]
    fn visibility_only_applies_to_soft_delete_models() {
        assert_eq!(
            visibility_condition(&user(), false),
            Some(Condition::is_null("deleted_at"))
        );
        assert_eq!(visibility_condition(&user(), true), None);
        assert_eq!(visibility_condition(&plain(), false), None);
    }

    #[test]
    fn delete_mode_follows_model_and_flag() {
        assert_eq!(
            delete_mode(&user(), false),
            DeleteMode::Logical {
                field: "deleted_at".to_string()
            }
        );
        assert_eq!(delete_mode(&user(), true), DeleteMode::Physical);
        assert_eq!(delete_mode(&plain(), false), DeleteMode::Physical);
    }
}
