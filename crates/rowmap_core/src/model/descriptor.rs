//! Model descriptors: static metadata for one record type.
//!
//! # Responsibility
//! - Declare fields, column names, types, defaults and special roles.
//! - Validate declarations once, at `build()` time.
//!
//! # Invariants
//! - Exactly one primary key field.
//! - At most one field per special role (soft delete, created/updated at).
//! - Field and column names are unique, compared case-insensitively.
//! - A built descriptor is immutable; callers share it through `Arc`.

use super::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Returns whether `value` is a plain SQL identifier safe to quote and embed.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER_RE.is_match(value)
}

/// Semantic field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Real,
    Text,
    /// Stored as INTEGER `0/1`.
    Boolean,
    /// Epoch milliseconds stored as INTEGER.
    Timestamp,
    Blob,
}

impl FieldType {
    /// Declared column type used in DDL.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean | Self::Timestamp => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }

    /// Returns whether `value` can be stored in a field of this type.
    pub fn accepts(self, value: &Value) -> bool {
        value.clone().coerce(self).is_some()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Blob => "blob",
        }
    }
}

/// How a primary key value is produced on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryKeyKind {
    /// SQLite rowid alias; assigned by the store.
    AutoIncrement,
    /// Random v4 UUID text; assigned by the mapper when unset.
    Uuid,
}

/// Special meaning attached to one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Plain,
    PrimaryKey(PrimaryKeyKind),
    /// Soft-delete marker; `NULL` means active.
    SoftDelete,
    CreatedAt,
    UpdatedAt,
}

impl FieldRole {
    fn label(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::PrimaryKey(_) => "primary_key",
            Self::SoftDelete => "soft_delete",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }
}

/// Target of a belongs-to foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

/// Declaration of one model field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub column: String,
    pub ty: FieldType,
    pub nullable: bool,
    pub default: Option<Value>,
    pub unique: bool,
    pub role: FieldRole,
    /// Parent row this field points at, rendered as `REFERENCES`.
    pub references: Option<ForeignKey>,
}

impl FieldDescriptor {
    /// Creates a nullable plain field whose column equals its name.
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            ty,
            nullable: true,
            default: None,
            unique: false,
            role: FieldRole::Plain,
            references: None,
        }
    }

    /// Integer auto-increment primary key.
    pub fn primary_key(name: impl Into<String>) -> Self {
        let mut field = Self::new(name, FieldType::Integer);
        field.nullable = false;
        field.role = FieldRole::PrimaryKey(PrimaryKeyKind::AutoIncrement);
        field
    }

    /// UUID text primary key generated on insert.
    pub fn uuid_key(name: impl Into<String>) -> Self {
        let mut field = Self::new(name, FieldType::Text);
        field.nullable = false;
        field.role = FieldRole::PrimaryKey(PrimaryKeyKind::Uuid);
        field
    }

    pub fn soft_delete(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Timestamp).with_role(FieldRole::SoftDelete)
    }

    pub fn created_at(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Timestamp).with_role(FieldRole::CreatedAt)
    }

    pub fn updated_at(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Timestamp).with_role(FieldRole::UpdatedAt)
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Declares a belongs-to link to `column` of `table`.
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn with_role(mut self, role: FieldRole) -> Self {
        self.role = role;
        self
    }

    pub fn is_primary_key(&self) -> bool {
        matches!(self.role, FieldRole::PrimaryKey(_))
    }

    pub fn is_soft_delete(&self) -> bool {
        self.role == FieldRole::SoftDelete
    }
}

/// Immutable schema metadata for one record type.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    name: String,
    table: String,
    fields: Vec<FieldDescriptor>,
    primary_key: usize,
}

impl ModelDescriptor {
    pub fn builder(name: impl Into<String>) -> ModelDescriptorBuilder {
        ModelDescriptorBuilder {
            name: name.into(),
            table: None,
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Looks up a field by name or column, case-insensitively.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name).or_else(|| {
            self.fields.iter().find(|field| {
                field.name.eq_ignore_ascii_case(name) || field.column.eq_ignore_ascii_case(name)
            })
        })
    }

    /// Looks up a field by its exact column name.
    pub fn field_by_column(&self, column: &str) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|field| field.column.eq_ignore_ascii_case(column))
    }

    pub fn primary_key(&self) -> &FieldDescriptor {
        &self.fields[self.primary_key]
    }

    /// First field declaring a foreign key into `table`.
    pub fn reference_to(&self, table: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| {
            field
                .references
                .as_ref()
                .is_some_and(|target| target.table.eq_ignore_ascii_case(table))
        })
    }

    pub fn soft_delete_field(&self) -> Option<&FieldDescriptor> {
        self.field_with_role(FieldRole::SoftDelete)
    }

    pub fn created_at_field(&self) -> Option<&FieldDescriptor> {
        self.field_with_role(FieldRole::CreatedAt)
    }

    pub fn updated_at_field(&self) -> Option<&FieldDescriptor> {
        self.field_with_role(FieldRole::UpdatedAt)
    }

    fn field_with_role(&self, role: FieldRole) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.role == role)
    }
}

/// Builder for [`ModelDescriptor`]; validation happens in [`Self::build`].
#[derive(Debug, Clone)]
pub struct ModelDescriptorBuilder {
    name: String,
    table: Option<String>,
    fields: Vec<FieldDescriptor>,
}

impl ModelDescriptorBuilder {
    /// Overrides the default table name (snake_case plural of the model).
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds `id`, `created_at`, `updated_at` and `deleted_at` bookkeeping fields.
    pub fn standard_fields(self) -> Self {
        self.field(FieldDescriptor::primary_key("id"))
            .field(FieldDescriptor::created_at("created_at"))
            .field(FieldDescriptor::updated_at("updated_at"))
            .field(FieldDescriptor::soft_delete("deleted_at"))
    }

    pub fn build(self) -> Result<ModelDescriptor, DescriptorError> {
        if !is_valid_identifier(&self.name) {
            return Err(DescriptorError::InvalidIdentifier(self.name));
        }
        let table = self.table.unwrap_or_else(|| default_table_name(&self.name));
        if !is_valid_identifier(&table) {
            return Err(DescriptorError::InvalidIdentifier(table));
        }
        if self.fields.is_empty() {
            return Err(DescriptorError::NoFields(self.name));
        }

        let mut primary_key = None;
        for (index, field) in self.fields.iter().enumerate() {
            let target = field
                .references
                .iter()
                .flat_map(|target| [&target.table, &target.column]);
            for identifier in [&field.name, &field.column].into_iter().chain(target) {
                if !is_valid_identifier(identifier) {
                    return Err(DescriptorError::InvalidIdentifier(identifier.clone()));
                }
            }

            let duplicate = self.fields[..index].iter().any(|other| {
                other.name.eq_ignore_ascii_case(&field.name)
                    || other.column.eq_ignore_ascii_case(&field.column)
            });
            if duplicate {
                return Err(DescriptorError::DuplicateField(field.name.clone()));
            }

            match field.role {
                FieldRole::Plain => {}
                FieldRole::PrimaryKey(kind) => {
                    if primary_key.is_some() {
                        return Err(DescriptorError::DuplicateRole("primary_key"));
                    }
                    let expected = match kind {
                        PrimaryKeyKind::AutoIncrement => FieldType::Integer,
                        PrimaryKeyKind::Uuid => FieldType::Text,
                    };
                    if field.ty != expected {
                        return Err(DescriptorError::RoleTypeMismatch {
                            field: field.name.clone(),
                            role: field.role.label(),
                        });
                    }
                    primary_key = Some(index);
                }
                FieldRole::SoftDelete | FieldRole::CreatedAt | FieldRole::UpdatedAt => {
                    if field.ty != FieldType::Timestamp {
                        return Err(DescriptorError::RoleTypeMismatch {
                            field: field.name.clone(),
                            role: field.role.label(),
                        });
                    }
                    if self.fields[..index]
                        .iter()
                        .any(|other| other.role == field.role)
                    {
                        return Err(DescriptorError::DuplicateRole(field.role.label()));
                    }
                }
            }

            if let Some(default) = &field.default {
                if default.is_null() || !field.ty.accepts(default) {
                    return Err(DescriptorError::DefaultTypeMismatch {
                        field: field.name.clone(),
                        expected: field.ty.label(),
                        actual: default.kind(),
                    });
                }
            }
        }

        let Some(primary_key) = primary_key else {
            return Err(DescriptorError::MissingPrimaryKey(self.name));
        };

        Ok(ModelDescriptor {
            name: self.name,
            table,
            fields: self.fields,
            primary_key,
        })
    }
}

/// Derives `users` from `User` and `api_users` from `APIUser`.
pub fn default_table_name(model_name: &str) -> String {
    let chars: Vec<char> = model_name.chars().collect();
    let mut snake = String::with_capacity(model_name.len() + 4);
    for (index, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && index > 0 {
            let prev = chars[index - 1];
            let next_is_lower = chars
                .get(index + 1)
                .is_some_and(|next| next.is_ascii_lowercase());
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower)
            {
                snake.push('_');
            }
        }
        snake.push(c.to_ascii_lowercase());
    }

    if snake.ends_with('s') || snake.ends_with('x') || snake.ends_with("ch") || snake.ends_with("sh")
    {
        snake.push_str("es");
    } else if snake.ends_with('y')
        && !matches!(
            snake.chars().rev().nth(1),
            Some('a' | 'e' | 'i' | 'o' | 'u')
        )
    {
        snake.pop();
        snake.push_str("ies");
    } else {
        snake.push('s');
    }
    snake
}

/// Descriptor declaration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    InvalidIdentifier(String),
    NoFields(String),
    DuplicateField(String),
    MissingPrimaryKey(String),
    DuplicateRole(&'static str),
    RoleTypeMismatch {
        field: String,
        role: &'static str,
    },
    DefaultTypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl Display for DescriptorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier(value) => write!(f, "invalid identifier `{value}`"),
            Self::NoFields(model) => write!(f, "model `{model}` declares no fields"),
            Self::DuplicateField(field) => write!(f, "duplicate field `{field}`"),
            Self::MissingPrimaryKey(model) => {
                write!(f, "model `{model}` must declare exactly one primary key")
            }
            Self::DuplicateRole(role) => write!(f, "more than one `{role}` field declared"),
            Self::RoleTypeMismatch { field, role } => {
                write!(f, "field `{field}` has a type incompatible with role `{role}`")
            }
            Self::DefaultTypeMismatch {
                field,
                expected,
                actual,
            } => write!(
                f,
                "default for field `{field}` must be {expected}, got {actual}"
            ),
        }
    }
}

impl Error for DescriptorError {}
