//! Immutable query plan snapshots.

use super::condition::Condition;
use crate::db::LockMode;
use crate::engine::ConflictPolicy;
use crate::model::{ModelDescriptor, Record, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTerm {
    Field { field: String, direction: Direction },
    /// Textual `"field [asc|desc], ..."` clause, parsed at render time.
    Clause(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// One projected output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectItem {
    Field(String),
    /// `field == None` means `*` (only meaningful for `Count`).
    Aggregate {
        func: AggregateFn,
        field: Option<String>,
        alias: String,
    },
}

impl SelectItem {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    pub fn count_all(alias: impl Into<String>) -> Self {
        Self::Aggregate {
            func: AggregateFn::Count,
            field: None,
            alias: alias.into(),
        }
    }

    pub fn aggregate(
        func: AggregateFn,
        field: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self::Aggregate {
            func,
            field: Some(field.into()),
            alias: alias.into(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Aggregate { .. })
    }
}

/// Row-fetch mode of a select plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    All,
    /// First row ordered by primary key ascending.
    First,
    /// One row, no implied ordering.
    Take,
    /// First row ordered by primary key descending.
    Last,
    Count,
}

/// Value or SQL expression written by an update.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Value(Value),
    /// Expression such as `price * ? + ?`; field names are not resolved.
    Expr { sql: String, params: Vec<Value> },
}

/// Ordered field assignments for update operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignments {
    entries: Vec<(String, Assignment)>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `field` to `value`, replacing an earlier assignment to it.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field.into(), Assignment::Value(value.into()));
        self
    }

    pub fn expr<V, I>(mut self, field: impl Into<String>, sql: impl Into<String>, params: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        self.push(
            field.into(),
            Assignment::Expr {
                sql: sql.into(),
                params: params.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    /// Non-zero values of `record`; zero values are skipped.
    pub fn from_record(record: &Record) -> Self {
        record
            .values()
            .iter()
            .filter(|(_, value)| !value.is_zero())
            .fold(Self::new(), |acc, (field, value)| {
                acc.set(field.as_str(), value.clone())
            })
    }

    /// Every entry, zero values included.
    pub fn from_map<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        pairs
            .into_iter()
            .fold(Self::new(), |acc, (field, value)| acc.set(field, value))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Assignment)> {
        self.entries
            .iter()
            .map(|(field, assignment)| (field.as_str(), assignment))
    }

    pub fn contains(&self, field: &str) -> bool {
        self.entries
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(field))
    }

    fn push(&mut self, field: String, assignment: Assignment) {
        self.entries
            .retain(|(name, _)| !name.eq_ignore_ascii_case(&field));
        self.entries.push((field, assignment));
    }
}

/// Insert behavior knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOptions {
    pub conflict: ConflictPolicy,
    /// Keep inserting after a failed record and report it per record.
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOp {
    pub records: Vec<Record>,
    pub options: InsertOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub assignments: Assignments,
    /// Stamp the updated-at field when the model has one.
    pub touch: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOp {
    /// Remove rows physically even when the model supports soft delete.
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Select(Fetch),
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    /// Clear the soft-delete marker of matched rows.
    Restore,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Select(_) => OperationKind::Select,
            Self::Insert(_) => OperationKind::Insert,
            Self::Update(_) => OperationKind::Update,
            Self::Delete(_) => OperationKind::Delete,
            Self::Restore => OperationKind::Restore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Select,
    Insert,
    Update,
    Delete,
    Restore,
    Raw,
}

impl OperationKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::Raw => "raw",
        }
    }

    pub fn is_bulk_mutation(self) -> bool {
        matches!(self, Self::Update | Self::Delete | Self::Restore)
    }
}

/// Immutable description of one data operation against one model.
///
/// Every builder method returns a new plan; the receiver is left untouched
/// so partially built plans can be shared and extended independently.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub(crate) model: Arc<ModelDescriptor>,
    pub(crate) operation: Operation,
    pub(crate) condition: Option<Condition>,
    pub(crate) select: Option<Vec<SelectItem>>,
    pub(crate) omit: Option<Vec<String>>,
    pub(crate) distinct: bool,
    pub(crate) group_by: Vec<String>,
    pub(crate) having: Option<Condition>,
    pub(crate) order: Vec<OrderTerm>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) lock: Option<LockMode>,
    pub(crate) include_deleted: bool,
    pub(crate) allow_global: bool,
}

impl QueryPlan {
    /// Starts a `Select(All)` plan for `model`.
    pub fn new(model: Arc<ModelDescriptor>) -> Self {
        Self {
            model,
            operation: Operation::Select(Fetch::All),
            condition: None,
            select: None,
            omit: None,
            distinct: false,
            group_by: Vec::new(),
            having: None,
            order: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
            include_deleted: false,
            allow_global: false,
        }
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn model_arc(&self) -> Arc<ModelDescriptor> {
        Arc::clone(&self.model)
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub fn includes_deleted(&self) -> bool {
        self.include_deleted
    }

    pub fn allows_global(&self) -> bool {
        self.allow_global
    }

    pub fn lock_mode(&self) -> Option<LockMode> {
        self.lock
    }

    /// Returns whether the plan carries a condition that restricts rows.
    pub fn is_restricted(&self) -> bool {
        self.condition
            .as_ref()
            .is_some_and(|condition| !condition.is_trivially_true())
    }

    fn derive(&self, update: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        update(&mut next);
        next
    }

    /// ANDs `condition` onto the current condition.
    pub fn filter(&self, condition: impl Into<Condition>) -> Self {
        let condition = condition.into();
        self.derive(|plan| {
            plan.condition = Some(match plan.condition.take() {
                Some(existing) => existing.and(condition),
                None => condition,
            });
        })
    }

    /// ORs `condition` with the current condition as a whole.
    pub fn or(&self, condition: impl Into<Condition>) -> Self {
        let condition = condition.into();
        self.derive(|plan| {
            plan.condition = Some(match plan.condition.take() {
                Some(existing) => existing.or(condition),
                None => condition,
            });
        })
    }

    /// ANDs the negation of `condition`.
    pub fn not(&self, condition: impl Into<Condition>) -> Self {
        self.filter(condition.into().negate())
    }

    /// Restricts the plan to one primary key value.
    pub fn target(&self, key: impl Into<Value>) -> Self {
        self.filter(Condition::primary_key(key))
    }

    pub fn targets<V, I>(&self, keys: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        self.filter(Condition::primary_keys(keys))
    }

    /// Projects the named fields. Entries may hold comma-separated lists.
    pub fn select<S, I>(&self, fields: I) -> Self
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
    {
        let items = split_names(fields)
            .into_iter()
            .map(SelectItem::Field)
            .collect();
        self.select_items(items)
    }

    pub fn select_items(&self, items: Vec<SelectItem>) -> Self {
        self.derive(|plan| plan.select = Some(items))
    }

    /// Projects every field except the named ones.
    pub fn omit<S, I>(&self, fields: I) -> Self
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
    {
        let names = split_names(fields);
        self.derive(|plan| plan.omit = Some(names))
    }

    /// Deduplicates rows; non-empty `fields` also become the projection.
    pub fn distinct<S, I>(&self, fields: I) -> Self
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
    {
        let names = split_names(fields);
        self.derive(|plan| {
            plan.distinct = true;
            if !names.is_empty() {
                plan.select = Some(names.into_iter().map(SelectItem::Field).collect());
            }
        })
    }

    pub fn group<S, I>(&self, fields: I) -> Self
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
    {
        let names = split_names(fields);
        self.derive(|plan| plan.group_by.extend(names))
    }

    /// ANDs `condition` onto the post-aggregation filter.
    pub fn having(&self, condition: Condition) -> Self {
        self.derive(|plan| {
            plan.having = Some(match plan.having.take() {
                Some(existing) => existing.and(condition),
                None => condition,
            });
        })
    }

    /// Appends a textual order clause such as `"age desc, name"`.
    pub fn order(&self, clause: impl Into<String>) -> Self {
        let clause = clause.into();
        self.derive(|plan| plan.order.push(OrderTerm::Clause(clause)))
    }

    pub fn order_by(&self, field: impl Into<String>, direction: Direction) -> Self {
        let field = field.into();
        self.derive(|plan| plan.order.push(OrderTerm::Field { field, direction }))
    }

    pub fn limit(&self, limit: u64) -> Self {
        self.derive(|plan| plan.limit = Some(limit))
    }

    pub fn without_limit(&self) -> Self {
        self.derive(|plan| plan.limit = None)
    }

    pub fn offset(&self, offset: u64) -> Self {
        self.derive(|plan| plan.offset = Some(offset))
    }

    pub fn without_offset(&self) -> Self {
        self.derive(|plan| plan.offset = None)
    }

    pub fn lock(&self, mode: LockMode) -> Self {
        self.derive(|plan| plan.lock = Some(mode))
    }

    /// Includes soft-deleted rows.
    pub fn unscoped(&self) -> Self {
        self.derive(|plan| plan.include_deleted = true)
    }

    /// Lets update/delete/restore run without any condition.
    pub fn allow_global(&self) -> Self {
        self.derive(|plan| plan.allow_global = true)
    }

    /// Applies one reusable plan transformer.
    pub fn scope(&self, scope: impl FnOnce(&QueryPlan) -> QueryPlan) -> Self {
        scope(self)
    }

    /// Applies reusable plan transformers in order.
    pub fn scopes(&self, scopes: &[&dyn Fn(&QueryPlan) -> QueryPlan]) -> Self {
        scopes
            .iter()
            .fold(self.clone(), |plan, scope| scope(&plan))
    }

    pub fn fetch(&self, fetch: Fetch) -> Self {
        self.derive(|plan| plan.operation = Operation::Select(fetch))
    }

    pub fn insert(&self, records: Vec<Record>, options: InsertOptions) -> Self {
        self.derive(|plan| plan.operation = Operation::Insert(InsertOp { records, options }))
    }

    pub fn update(&self, assignments: Assignments) -> Self {
        self.derive(|plan| {
            plan.operation = Operation::Update(UpdateOp {
                assignments,
                touch: true,
            })
        })
    }

    /// Update that leaves the updated-at field alone.
    pub fn update_columns(&self, assignments: Assignments) -> Self {
        self.derive(|plan| {
            plan.operation = Operation::Update(UpdateOp {
                assignments,
                touch: false,
            })
        })
    }

    pub fn delete(&self, op: DeleteOp) -> Self {
        self.derive(|plan| plan.operation = Operation::Delete(op))
    }

    pub fn restore(&self) -> Self {
        self.derive(|plan| plan.operation = Operation::Restore)
    }

    /// Current condition, or an always-true conjunction when unset.
    pub fn to_condition(&self) -> Condition {
        self.condition
            .clone()
            .unwrap_or_else(|| Condition::all(Vec::new()))
    }
}

impl From<&QueryPlan> for Condition {
    /// Groups the plan's condition so it can nest inside another plan.
    fn from(plan: &QueryPlan) -> Self {
        plan.to_condition()
    }
}

fn split_names<S, I>(fields: I) -> Vec<String>
where
    S: AsRef<str>,
    I: IntoIterator<Item = S>,
{
    fields
        .into_iter()
        .flat_map(|entry| {
            entry
                .as_ref()
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Assignment, Assignments, Direction, Fetch, Operation, OrderTerm, QueryPlan};
    use crate::model::{FieldDescriptor, FieldType, ModelDescriptor, Record, Value};
    use crate::query::Condition;
    use std::sync::Arc;

    fn users() -> Arc<ModelDescriptor> {
        Arc::new(
            ModelDescriptor::builder("User")
                .standard_fields()
                .field(FieldDescriptor::new("name", FieldType::Text))
                .field(FieldDescriptor::new("age", FieldType::Integer))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn builder_leaves_receiver_untouched() {
        let base = QueryPlan::new(users()).filter(Condition::eq("name", "jinzhu"));
        let narrowed = base.filter(Condition::ge("age", 18)).limit(5);

        assert_eq!(base.condition(), Some(&Condition::eq("name", "jinzhu")));
        assert_eq!(base.limit, None);
        assert_eq!(narrowed.limit, Some(5));
        assert!(matches!(narrowed.condition(), Some(Condition::And(parts)) if parts.len() == 2));
    }

    #[test]
    fn select_splits_comma_lists() {
        let plan = QueryPlan::new(users()).select(["name, age", "id"]);
        let names: Vec<_> = plan
            .select
            .unwrap()
            .into_iter()
            .map(|item| format!("{item:?}"))
            .collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn distinct_sets_projection() {
        let plan = QueryPlan::new(users()).distinct(["name", "age"]);
        assert!(plan.distinct);
        assert_eq!(plan.select.map(|items| items.len()), Some(2));
    }

    #[test]
    fn order_terms_accumulate() {
        let plan = QueryPlan::new(users())
            .order("age desc")
            .order_by("name", Direction::Asc);
        assert_eq!(
            plan.order,
            vec![
                OrderTerm::Clause("age desc".to_string()),
                OrderTerm::Field {
                    field: "name".to_string(),
                    direction: Direction::Asc
                }
            ]
        );
    }

    #[test]
    fn trivially_true_condition_is_not_a_restriction() {
        let plan = QueryPlan::new(users());
        assert!(!plan.is_restricted());
        assert!(!plan.filter(Condition::matching(&Record::new())).is_restricted());
        assert!(plan.target(1).is_restricted());
    }

    #[test]
    fn scopes_apply_in_order() {
        let adults = |plan: &QueryPlan| plan.filter(Condition::ge("age", 18));
        let first_page = |plan: &QueryPlan| plan.limit(10);
        let plan = QueryPlan::new(users())
            .scopes(&[&adults, &first_page])
            .fetch(Fetch::First);
        assert_eq!(plan.limit, Some(10));
        assert_eq!(plan.operation, Operation::Select(Fetch::First));
    }

    #[test]
    fn assignments_from_record_skip_zero_values() {
        let record = Record::new().with("name", "hello").with("age", 0);
        let assignments = Assignments::from_record(&record);
        assert_eq!(assignments.len(), 1);
        assert!(assignments.contains("NAME"));

        let assignments = Assignments::new()
            .set("age", 1)
            .set("Age", 2)
            .expr("age", "age + ?", [1]);
        let collected: Vec<_> = assignments.iter().collect();
        assert_eq!(collected.len(), 1);
        assert!(matches!(collected[0].1, Assignment::Expr { params, .. } if params == &vec![Value::from(1)]));
    }
}
