//! Data model shared by every layer.
//!
//! # Responsibility
//! - Define values, model descriptors and records.
//! - Keep descriptor metadata explicit instead of reflection-derived.
//!
//! # Invariants
//! - Descriptors are validated once and immutable afterwards.
//! - Soft delete is an explicit descriptor role, never a naming convention.

pub mod descriptor;
pub mod record;
pub mod value;

pub use descriptor::{
    default_table_name, is_valid_identifier, DescriptorError, FieldDescriptor, FieldRole,
    FieldType, ForeignKey, ModelDescriptor, ModelDescriptorBuilder, PrimaryKeyKind,
};
pub use record::{Record, RecordError, RecordState};
pub use value::Value;

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
