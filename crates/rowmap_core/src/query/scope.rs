//! Named, reusable plan transformers.

use super::plan::QueryPlan;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Shared plan transformer.
pub type ScopeFn = Arc<dyn Fn(&QueryPlan) -> QueryPlan + Send + Sync>;

/// Scope registration/lookup errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    InvalidName(String),
    Duplicate(String),
    NotFound(String),
}

impl Display for ScopeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(value) => write!(f, "scope name is invalid: {value}"),
            Self::Duplicate(value) => write!(f, "scope already registered: {value}"),
            Self::NotFound(value) => write!(f, "scope not found: {value}"),
        }
    }
}

impl Error for ScopeError {}

/// Registry of named scopes such as `"adults"` or `"paid_with_card"`.
#[derive(Clone, Default)]
pub struct ScopeRegistry {
    scopes: BTreeMap<String, ScopeFn>,
}

impl Debug for ScopeRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("scopes", &self.names())
            .finish()
    }
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one scope under a unique name.
    pub fn register(
        &mut self,
        name: &str,
        scope: impl Fn(&QueryPlan) -> QueryPlan + Send + Sync + 'static,
    ) -> Result<(), ScopeError> {
        let name = name.trim().to_string();
        if !is_valid_scope_name(&name) {
            return Err(ScopeError::InvalidName(name));
        }
        if self.scopes.contains_key(name.as_str()) {
            return Err(ScopeError::Duplicate(name));
        }
        self.scopes.insert(name, Arc::new(scope));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ScopeFn> {
        self.scopes.get(name.trim()).cloned()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Returns sorted scope names.
    pub fn names(&self) -> Vec<String> {
        self.scopes.keys().cloned().collect()
    }

    /// Applies the named scopes to `plan`, in the given order.
    ///
    /// Fails on the first unknown name without applying anything.
    pub fn apply(&self, plan: &QueryPlan, names: &[&str]) -> Result<QueryPlan, ScopeError> {
        let scopes = names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| ScopeError::NotFound(name.trim().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scopes
            .iter()
            .fold(plan.clone(), |current, scope| scope(&current)))
    }
}

fn is_valid_scope_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::{ScopeError, ScopeRegistry};
    use crate::model::{FieldDescriptor, FieldType, ModelDescriptor};
    use crate::query::{Condition, QueryPlan};
    use std::sync::Arc;

    fn plan() -> QueryPlan {
        QueryPlan::new(Arc::new(
            ModelDescriptor::builder("Order")
                .standard_fields()
                .field(FieldDescriptor::new("amount", FieldType::Integer))
                .field(FieldDescriptor::new("pay_mode", FieldType::Text))
                .build()
                .unwrap(),
        ))
    }

    #[test]
    fn register_rejects_invalid_and_duplicate_names() {
        let mut registry = ScopeRegistry::new();
        registry
            .register("amount_gt_1000", |plan| {
                plan.filter(Condition::gt("amount", 1000))
            })
            .unwrap();

        assert_eq!(
            registry.register("Amount GT", |plan| plan.clone()),
            Err(ScopeError::InvalidName("Amount GT".to_string()))
        );
        assert_eq!(
            registry.register("amount_gt_1000", |plan| plan.clone()),
            Err(ScopeError::Duplicate("amount_gt_1000".to_string()))
        );
        assert_eq!(registry.names(), vec!["amount_gt_1000".to_string()]);
    }

    #[test]
    fn apply_composes_in_order() {
        let mut registry = ScopeRegistry::new();
        registry
            .register("amount_gt_1000", |plan| {
                plan.filter(Condition::gt("amount", 1000))
            })
            .unwrap();
        registry
            .register("paid_with_card", |plan| {
                plan.filter(Condition::eq("pay_mode", "card"))
            })
            .unwrap();

        let scoped = registry
            .apply(&plan(), &["amount_gt_1000", "paid_with_card"])
            .unwrap();
        assert_eq!(
            scoped.condition(),
            Some(&Condition::And(vec![
                Condition::gt("amount", 1000),
                Condition::eq("pay_mode", "card"),
            ]))
        );
    }

    #[test]
    fn apply_reports_unknown_scope() {
        let registry = ScopeRegistry::new();
        let err = registry.apply(&plan(), &["missing"]).unwrap_err();
        assert_eq!(err, ScopeError::NotFound("missing".to_string()));
    }
}
