//! Composable filter predicates.
//!
//! Conditions name fields, not columns; resolution happens at render time
//! so the same tree can be reused across plans for one model.

use crate::model::{Record, Value};
use std::ops::Not;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Boolean predicate tree over model fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Comparing against `Value::Null` renders as `IS NULL` / `IS NOT NULL`.
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    Like {
        field: String,
        pattern: String,
    },
    Between {
        field: String,
        low: Value,
        high: Value,
    },
    IsNull {
        field: String,
    },
    /// Primary key membership, resolved against the plan's model.
    PrimaryKey(Vec<Value>),
    /// Raw SQL fragment with `?` placeholders.
    Raw {
        sql: String,
        params: Vec<Value>,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ge, value)
    }

    /// Membership test; an empty set matches nothing.
    pub fn is_in<V, I>(field: impl Into<String>, values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<V, I>(field: impl Into<String>, values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        !Self::is_in(field, values)
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Like {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    pub fn between(
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Self::Between {
            field: field.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull {
            field: field.into(),
        }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        !Self::is_null(field)
    }

    pub fn primary_key(value: impl Into<Value>) -> Self {
        Self::PrimaryKey(vec![value.into()])
    }

    pub fn primary_keys<V, I>(values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Self::PrimaryKey(values.into_iter().map(Into::into).collect())
    }

    /// Raw fragment; placeholder count is checked when the plan renders.
    pub fn raw<V, I>(sql: impl Into<String>, params: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Self::Raw {
            sql: sql.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Structural match: equality on every non-zero value of `record`.
    ///
    /// Zero values (0, "", false, null) are skipped, so a record with only
    /// zero fields matches everything.
    pub fn matching(record: &Record) -> Self {
        let mut parts = Vec::new();
        if let Some(key) = record.primary_key().filter(|key| !key.is_zero()) {
            parts.push(Self::PrimaryKey(vec![key.clone()]));
        }
        parts.extend(
            record
                .values()
                .iter()
                .filter(|(_, value)| !value.is_zero())
                .map(|(field, value)| Self::eq(field.as_str(), value.clone())),
        );
        Self::all(parts)
    }

    /// Map match: equality on every entry, zero values included.
    pub fn from_map<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::all(
            pairs
                .into_iter()
                .map(|(field, value)| Self::eq(field, value))
                .collect(),
        )
    }

    /// Conjunction; an empty list is always true.
    pub fn all(parts: Vec<Condition>) -> Self {
        parts
            .into_iter()
            .fold(Self::And(Vec::new()), |acc, part| acc.and(part))
    }

    /// Disjunction; an empty list is always false.
    pub fn any(parts: Vec<Condition>) -> Self {
        let mut parts = parts.into_iter();
        match parts.next() {
            Some(first) => parts.fold(first, |acc, part| acc.or(part)),
            None => Self::Or(Vec::new()),
        }
    }

    /// `self AND other`, flattening nested conjunctions.
    pub fn and(self, other: Condition) -> Self {
        match (self, other) {
            (Self::And(mut lhs), Self::And(rhs)) => {
                lhs.extend(rhs);
                Self::And(lhs)
            }
            (Self::And(mut lhs), rhs) => {
                lhs.push(rhs);
                Self::And(lhs)
            }
            (lhs, Self::And(mut rhs)) => {
                rhs.insert(0, lhs);
                Self::And(rhs)
            }
            (lhs, rhs) => Self::And(vec![lhs, rhs]),
        }
    }

    /// `self OR other`, flattening nested disjunctions.
    pub fn or(self, other: Condition) -> Self {
        match (self, other) {
            (Self::Or(mut lhs), Self::Or(rhs)) => {
                lhs.extend(rhs);
                Self::Or(lhs)
            }
            (Self::Or(mut lhs), rhs) => {
                lhs.push(rhs);
                Self::Or(lhs)
            }
            (lhs, Self::Or(mut rhs)) => {
                rhs.insert(0, lhs);
                Self::Or(rhs)
            }
            (lhs, rhs) => Self::Or(vec![lhs, rhs]),
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    /// Returns whether this condition filters nothing out.
    pub fn is_trivially_true(&self) -> bool {
        match self {
            Self::And(parts) => parts.iter().all(Self::is_trivially_true),
            Self::Or(parts) => parts.iter().any(Self::is_trivially_true),
            _ => false,
        }
    }
}

impl Not for Condition {
    type Output = Condition;

    fn not(self) -> Self::Output {
        self.negate()
    }
}
