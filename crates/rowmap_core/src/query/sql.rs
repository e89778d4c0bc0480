//! Plan-to-SQLite rendering.
//!
//! # Invariants
//! - Values are always bound as positional `?` params, never inlined.
//! - Identifiers are always double-quoted.
//! - Param order equals placeholder order in the rendered text.

use super::condition::{CompareOp, Condition};
use super::plan::{Assignment, Fetch, OrderTerm, QueryPlan, SelectItem, UpdateOp};
use super::{QueryError, QueryResult};
use crate::db::Statement;
use crate::engine::policy::{visibility_condition, ConflictResolution, DeleteMode};
use crate::mapper::selected_fields;
use crate::model::{is_valid_identifier, FieldDescriptor, ModelDescriptor, Value};
use once_cell::sync::Lazy;
use regex::Regex;

static ORDER_TERM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\s+((?i:asc|desc)))?$").expect("valid order regex")
});

/// Double-quotes an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Parameter slots referenced by a SQL text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Placeholders {
    /// Highest parameter index, which is the number of params SQLite binds.
    pub slots: usize,
    /// Whether any `?NNN` or `:name`/`@name`/`$name` parameter appears.
    pub explicit: bool,
}

/// Scans `sql` the way SQLite numbers parameters.
///
/// A bare `?` takes the next index, `?NNN` names its index, and a named
/// parameter takes the next index the first time it appears. Quoted text,
/// bracketed identifiers, and comments are skipped.
pub(crate) fn scan_placeholders(sql: &str) -> Placeholders {
    let chars: Vec<char> = sql.chars().collect();
    let mut names: Vec<String> = Vec::new();
    let mut found = Placeholders::default();
    let mut at = 0;
    while at < chars.len() {
        match chars[at] {
            quote @ ('\'' | '"' | '`') => at = skip_past(&chars, at + 1, &[quote]),
            '[' => at = skip_past(&chars, at + 1, &[']']),
            '-' if chars.get(at + 1) == Some(&'-') => at = skip_past(&chars, at + 2, &['\n']),
            '/' if chars.get(at + 1) == Some(&'*') => at = skip_past(&chars, at + 2, &['*', '/']),
            '?' => {
                let end = scan_while(&chars, at + 1, |c| c.is_ascii_digit());
                if end == at + 1 {
                    found.slots += 1;
                } else {
                    let index: String = chars[at + 1..end].iter().collect();
                    found.slots = found.slots.max(index.parse().unwrap_or(usize::MAX));
                    found.explicit = true;
                }
                at = end;
            }
            ':' | '@' | '$'
                if chars.get(at + 1).is_some_and(|c| is_name_char(*c))
                    && !(at > 0 && is_name_char(chars[at - 1])) =>
            {
                let end = scan_while(&chars, at + 1, is_name_char);
                let name: String = chars[at..end].iter().collect();
                if !names.contains(&name) {
                    names.push(name);
                    found.slots += 1;
                }
                found.explicit = true;
                at = end;
            }
            _ => at += 1,
        }
    }
    found
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn scan_while(chars: &[char], from: usize, keep: impl Fn(char) -> bool) -> usize {
    chars[from.min(chars.len())..]
        .iter()
        .position(|c| !keep(*c))
        .map_or(chars.len(), |offset| from + offset)
}

/// Index just past the first `close` sequence at or after `from`.
fn skip_past(chars: &[char], from: usize, close: &[char]) -> usize {
    let from = from.min(chars.len());
    chars[from..]
        .windows(close.len())
        .position(|window| window == close)
        .map_or(chars.len(), |offset| from + offset + close.len())
}

/// Checks a complete statement against its params.
pub(crate) fn check_placeholders(sql: &str, params: usize) -> QueryResult<()> {
    let placeholders = scan_placeholders(sql).slots;
    if placeholders != params {
        return Err(QueryError::PlaceholderMismatch {
            sql: sql.to_string(),
            placeholders,
            params,
        });
    }
    Ok(())
}

/// Checks a fragment spliced into a rendered statement; only bare `?` keeps
/// its meaning there.
pub(crate) fn check_fragment_placeholders(sql: &str, params: usize) -> QueryResult<()> {
    if scan_placeholders(sql).explicit {
        return Err(QueryError::FragmentPlaceholder(sql.to_string()));
    }
    check_placeholders(sql, params)
}

/// Result layout of a rendered select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    /// Model fields; rows map back to records.
    Records,
    /// Single aggregate, no grouping.
    Scalar,
    /// Mixed or grouped projection; rows stay as column maps.
    Rows,
}

/// Accumulates params while rendering fragments of one statement.
struct Renderer<'a> {
    model: &'a ModelDescriptor,
    aliases: Vec<&'a str>,
    params: Vec<Value>,
}

impl<'a> Renderer<'a> {
    fn new(plan: &'a QueryPlan) -> Self {
        let aliases = plan
            .select
            .iter()
            .flatten()
            .filter_map(|item| match item {
                SelectItem::Aggregate { alias, .. } => Some(alias.as_str()),
                SelectItem::Field(_) => None,
            })
            .collect();
        Self {
            model: &plan.model,
            aliases,
            params: Vec::new(),
        }
    }

    fn for_model(model: &'a ModelDescriptor) -> Self {
        Self {
            model,
            aliases: Vec::new(),
            params: Vec::new(),
        }
    }

    fn field(&self, name: &str) -> QueryResult<&'a FieldDescriptor> {
        self.model
            .field(name)
            .ok_or_else(|| QueryError::UnknownField {
                model: self.model.name().to_string(),
                field: name.to_string(),
            })
    }

    /// Quoted column for a field name, or a projection alias.
    fn column(&self, name: &str) -> QueryResult<String> {
        if let Some(field) = self.model.field(name) {
            return Ok(quote_ident(&field.column));
        }
        self.aliases
            .iter()
            .find(|alias| alias.eq_ignore_ascii_case(name))
            .map(|alias| quote_ident(alias))
            .ok_or_else(|| QueryError::UnknownField {
                model: self.model.name().to_string(),
                field: name.to_string(),
            })
    }

    fn bind(&mut self, value: &Value) -> &'static str {
        self.params.push(value.clone());
        "?"
    }

    fn bind_list(&mut self, values: &[Value]) -> String {
        values
            .iter()
            .map(|value| self.bind(value))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn condition(&mut self, condition: &Condition) -> QueryResult<String> {
        let sql = match condition {
            Condition::Compare { field, op, value } => {
                let column = self.column(field)?;
                match (op, value) {
                    (CompareOp::Eq, Value::Null) => format!("{column} IS NULL"),
                    (CompareOp::Ne, Value::Null) => format!("{column} IS NOT NULL"),
                    _ => format!("{column} {} {}", op.symbol(), self.bind(value)),
                }
            }
            Condition::In { field, values } => {
                let column = self.column(field)?;
                self.membership(column, values)
            }
            Condition::PrimaryKey(values) => {
                let column = quote_ident(&self.model.primary_key().column);
                self.membership(column, values)
            }
            Condition::Like { field, pattern } => {
                let column = self.column(field)?;
                format!("{column} LIKE {}", self.bind(&Value::from(pattern.as_str())))
            }
            Condition::Between { field, low, high } => {
                let column = self.column(field)?;
                let low = self.bind(low);
                let high = self.bind(high);
                format!("{column} BETWEEN {low} AND {high}")
            }
            Condition::IsNull { field } => format!("{} IS NULL", self.column(field)?),
            Condition::Raw { sql, params } => {
                check_fragment_placeholders(sql, params.len())?;
                self.params.extend(params.iter().cloned());
                sql.clone()
            }
            Condition::And(parts) => self.junction(parts, " AND ", "1 = 1")?,
            Condition::Or(parts) => self.junction(parts, " OR ", "1 = 0")?,
            Condition::Not(inner) => match inner.as_ref() {
                Condition::IsNull { field } => format!("{} IS NOT NULL", self.column(field)?),
                inner => format!("NOT ({})", self.condition(inner)?),
            },
        };
        Ok(sql)
    }

    fn membership(&mut self, column: String, values: &[Value]) -> String {
        match values {
            [] => "1 = 0".to_string(),
            [single] => format!("{column} = {}", self.bind(single)),
            many => format!("{column} IN ({})", self.bind_list(many)),
        }
    }

    fn junction(
        &mut self,
        parts: &[Condition],
        separator: &str,
        empty: &str,
    ) -> QueryResult<String> {
        match parts {
            [] => Ok(empty.to_string()),
            [single] => self.condition(single),
            many => {
                let mut rendered = Vec::with_capacity(many.len());
                for part in many {
                    let sql = self.condition(part)?;
                    rendered.push(if needs_group(part) {
                        format!("({sql})")
                    } else {
                        sql
                    });
                }
                Ok(rendered.join(separator))
            }
        }
    }

    /// ` WHERE ...` for the conjunction of `parts`, or empty text.
    fn where_clause(&mut self, parts: Vec<Condition>) -> QueryResult<String> {
        let condition = Condition::all(parts);
        if condition.is_trivially_true() {
            return Ok(String::new());
        }
        Ok(format!(" WHERE {}", self.condition(&condition)?))
    }

    fn finish(self, sql: String) -> Statement {
        Statement::new(sql, self.params)
    }
}

fn needs_group(condition: &Condition) -> bool {
    match condition {
        Condition::And(parts) | Condition::Or(parts) => parts.len() > 1,
        Condition::Raw { .. } => true,
        _ => false,
    }
}

/// Plan condition plus the soft-delete visibility filter.
fn scoped_conditions(plan: &QueryPlan) -> Vec<Condition> {
    plan.condition
        .iter()
        .cloned()
        .chain(visibility_condition(&plan.model, plan.include_deleted))
        .collect()
}

fn projection(plan: &QueryPlan, renderer: &Renderer<'_>) -> QueryResult<(String, Shape)> {
    let items = match &plan.select {
        Some(items) if items.iter().any(SelectItem::is_aggregate) => items,
        Some(items) => {
            let names: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    SelectItem::Field(name) => Some(name.clone()),
                    SelectItem::Aggregate { .. } => None,
                })
                .collect();
            return record_projection(plan, Some(names.as_slice()));
        }
        None => return record_projection(plan, None),
    };

    if plan.omit.is_some() {
        return Err(QueryError::ProjectionConflict);
    }
    let mut columns = Vec::with_capacity(items.len());
    for item in items {
        columns.push(match item {
            SelectItem::Field(name) => renderer.column(name)?,
            SelectItem::Aggregate { func, field, alias } => {
                if !is_valid_identifier(alias) {
                    return Err(QueryError::InvalidSelect(format!(
                        "aggregate alias `{alias}` is not an identifier"
                    )));
                }
                let argument = match field {
                    Some(field) => quote_ident(&renderer.field(field)?.column),
                    None => "*".to_string(),
                };
                format!("{}({argument}) AS {}", func.keyword(), quote_ident(alias))
            }
        });
    }
    let shape = if items.len() == 1 && plan.group_by.is_empty() {
        Shape::Scalar
    } else {
        Shape::Rows
    };
    Ok((columns.join(", "), shape))
}

fn record_projection(plan: &QueryPlan, select: Option<&[String]>) -> QueryResult<(String, Shape)> {
    let fields = selected_fields(&plan.model, select, plan.omit.as_deref())?;
    let columns = fields
        .iter()
        .map(|field| quote_ident(&field.column))
        .collect::<Vec<_>>()
        .join(", ");
    Ok((columns, Shape::Records))
}

fn order_clause(renderer: &Renderer<'_>, terms: &[OrderTerm]) -> QueryResult<Vec<String>> {
    let mut rendered = Vec::new();
    for term in terms {
        match term {
            OrderTerm::Field { field, direction } => {
                rendered.push(format!("{} {}", renderer.column(field)?, direction.keyword()));
            }
            OrderTerm::Clause(clause) => {
                for piece in clause.split(',').map(str::trim) {
                    let captures = ORDER_TERM_RE
                        .captures(piece)
                        .ok_or_else(|| QueryError::InvalidOrder(clause.clone()))?;
                    let column = renderer.column(&captures[1])?;
                    let direction = captures
                        .get(2)
                        .map_or("ASC", |m| {
                            if m.as_str().eq_ignore_ascii_case("desc") {
                                "DESC"
                            } else {
                                "ASC"
                            }
                        });
                    rendered.push(format!("{column} {direction}"));
                }
            }
        }
    }
    Ok(rendered)
}

fn limit_clause(limit: Option<u64>, offset: Option<u64>) -> String {
    match (limit, offset) {
        (Some(limit), Some(offset)) => format!(" LIMIT {limit} OFFSET {offset}"),
        (Some(limit), None) => format!(" LIMIT {limit}"),
        // SQLite needs LIMIT before OFFSET; -1 means unbounded.
        (None, Some(offset)) => format!(" LIMIT -1 OFFSET {offset}"),
        (None, None) => String::new(),
    }
}

/// Renders a row-returning select for `fetch` (anything but `Count`).
pub(crate) fn render_select(plan: &QueryPlan, fetch: Fetch) -> QueryResult<(Statement, Shape)> {
    let mut renderer = Renderer::new(plan);
    let (columns, shape) = projection(plan, &renderer)?;
    if shape != Shape::Records && matches!(fetch, Fetch::First | Fetch::Last | Fetch::Take) {
        return Err(QueryError::InvalidSelect(
            "single-record fetch needs a field projection".to_string(),
        ));
    }

    let distinct = if plan.distinct { "DISTINCT " } else { "" };
    let mut sql = format!(
        "SELECT {distinct}{columns} FROM {}",
        quote_ident(plan.model.table())
    );
    sql.push_str(&renderer.where_clause(scoped_conditions(plan))?);

    if !plan.group_by.is_empty() {
        let columns = plan
            .group_by
            .iter()
            .map(|field| renderer.column(field))
            .collect::<QueryResult<Vec<_>>>()?;
        sql.push_str(" GROUP BY ");
        sql.push_str(&columns.join(", "));
    }
    if let Some(having) = &plan.having {
        sql.push_str(" HAVING ");
        sql.push_str(&renderer.condition(having)?);
    }

    let mut order = order_clause(&renderer, &plan.order)?;
    let primary_key = quote_ident(&plan.model.primary_key().column);
    let limit = match fetch {
        Fetch::First => {
            order.push(format!("{primary_key} ASC"));
            Some(1)
        }
        Fetch::Last => {
            order.push(format!("{primary_key} DESC"));
            Some(1)
        }
        Fetch::Take => Some(1),
        Fetch::All | Fetch::Count => plan.limit,
    };
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    sql.push_str(&limit_clause(limit, plan.offset));

    Ok((renderer.finish(sql).with_lock(plan.lock), shape))
}

/// Renders `SELECT COUNT(*)`; order, limit and offset are ignored.
pub(crate) fn render_count(plan: &QueryPlan) -> QueryResult<Statement> {
    if plan.distinct || !plan.group_by.is_empty() || plan.select.is_some() {
        let mut inner = plan.clone();
        inner.order.clear();
        inner.limit = None;
        inner.offset = None;
        let (statement, _) = render_select(&inner, Fetch::All)?;
        let sql = format!("SELECT COUNT(*) FROM ({})", statement.sql);
        return Ok(Statement::new(sql, statement.params).with_lock(plan.lock));
    }

    let mut renderer = Renderer::new(plan);
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(plan.model.table()));
    sql.push_str(&renderer.where_clause(scoped_conditions(plan))?);
    Ok(renderer.finish(sql).with_lock(plan.lock))
}

/// Renders `UPDATE ... SET ...`; `now` stamps the updated-at field.
pub(crate) fn render_update(plan: &QueryPlan, op: &UpdateOp, now: i64) -> QueryResult<Statement> {
    if op.assignments.is_empty() {
        return Err(QueryError::EmptyUpdate);
    }
    let mut renderer = Renderer::new(plan);
    let mut sets = Vec::with_capacity(op.assignments.len() + 1);
    for (name, assignment) in op.assignments.iter() {
        let field = renderer.field(name)?;
        if field.is_primary_key() {
            return Err(QueryError::ImmutableField(field.name.clone()));
        }
        let column = quote_ident(&field.column);
        match assignment {
            Assignment::Value(value) => {
                check_type(field, value)?;
                sets.push(format!("{column} = {}", renderer.bind(value)));
            }
            Assignment::Expr { sql, params } => {
                check_fragment_placeholders(sql, params.len())?;
                renderer.params.extend(params.iter().cloned());
                sets.push(format!("{column} = ({sql})"));
            }
        }
    }
    if op.touch {
        if let Some(updated_at) = plan.model.updated_at_field() {
            if !op.assignments.contains(&updated_at.name) {
                let column = quote_ident(&updated_at.column);
                sets.push(format!("{column} = {}", renderer.bind(&Value::Integer(now))));
            }
        }
    }

    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_ident(plan.model.table()),
        sets.join(", ")
    );
    sql.push_str(&renderer.where_clause(scoped_conditions(plan))?);
    Ok(renderer.finish(sql))
}

/// Renders a logical (tombstone) or physical delete.
///
/// Logical deletes only touch live rows so the first timestamp sticks;
/// physical deletes ignore visibility.
pub(crate) fn render_delete(plan: &QueryPlan, mode: &DeleteMode, now: i64) -> QueryResult<Statement> {
    let mut renderer = Renderer::new(plan);
    let table = quote_ident(plan.model.table());
    let statement = match mode {
        DeleteMode::Logical { field } => {
            let column = quote_ident(&renderer.field(field)?.column);
            let mut sql = format!(
                "UPDATE {table} SET {column} = {}",
                renderer.bind(&Value::Integer(now))
            );
            let parts = plan
                .condition
                .iter()
                .cloned()
                .chain(Some(Condition::is_null(field.as_str())))
                .collect();
            sql.push_str(&renderer.where_clause(parts)?);
            renderer.finish(sql)
        }
        DeleteMode::Physical => {
            let mut sql = format!("DELETE FROM {table}");
            sql.push_str(&renderer.where_clause(plan.condition.iter().cloned().collect())?);
            renderer.finish(sql)
        }
    };
    Ok(statement)
}

/// Renders the tombstone-clearing update for soft-deleted matches.
pub(crate) fn render_restore(plan: &QueryPlan) -> QueryResult<Statement> {
    let field = plan.model.soft_delete_field().ok_or_else(|| {
        QueryError::Unsupported(format!(
            "model `{}` has no soft-delete field to restore",
            plan.model.name()
        ))
    })?;
    let mut renderer = Renderer::new(plan);
    let mut sql = format!(
        "UPDATE {} SET {} = NULL",
        quote_ident(plan.model.table()),
        quote_ident(&field.column)
    );
    let parts = plan
        .condition
        .iter()
        .cloned()
        .chain(Some(Condition::is_not_null(field.name.as_str())))
        .collect();
    sql.push_str(&renderer.where_clause(parts)?);
    Ok(renderer.finish(sql))
}

/// Renders one single-row insert returning the stored primary key, plus the
/// soft-delete marker when the model has one.
///
/// A `Skip` outcome returns no row.
pub(crate) fn render_insert(
    model: &ModelDescriptor,
    row: &[(&FieldDescriptor, Value)],
    resolution: &ConflictResolution,
) -> Statement {
    let mut renderer = Renderer::for_model(model);
    let table = quote_ident(model.table());
    let mut returning = quote_ident(&model.primary_key().column);
    if let Some(marker) = model.soft_delete_field() {
        returning.push_str(", ");
        returning.push_str(&quote_ident(&marker.column));
    }

    if row.is_empty() {
        // Upsert clauses are not allowed with DEFAULT VALUES.
        return renderer.finish(format!(
            "INSERT INTO {table} DEFAULT VALUES RETURNING {returning}"
        ));
    }

    let columns = row
        .iter()
        .map(|(field, _)| quote_ident(&field.column))
        .collect::<Vec<_>>()
        .join(", ");
    let values: Vec<Value> = row.iter().map(|(_, value)| value.clone()).collect();
    let placeholders = renderer.bind_list(&values);
    let mut sql = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})");
    match resolution {
        ConflictResolution::Raise => {}
        ConflictResolution::Skip => sql.push_str(" ON CONFLICT DO NOTHING"),
        ConflictResolution::Merge(merge) if merge.is_empty() => {
            sql.push_str(" ON CONFLICT DO NOTHING")
        }
        ConflictResolution::Merge(merge) => {
            let sets = merge
                .iter()
                .map(|column| {
                    let column = quote_ident(column);
                    format!("{column} = excluded.{column}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" ON CONFLICT DO UPDATE SET ");
            sql.push_str(&sets);
        }
    }
    sql.push_str(" RETURNING ");
    sql.push_str(&returning);
    renderer.finish(sql)
}

/// Rejects values whose kind cannot be stored in `field`.
pub(crate) fn check_type(field: &FieldDescriptor, value: &Value) -> QueryResult<()> {
    if field.ty.accepts(value) {
        return Ok(());
    }
    Err(QueryError::TypeMismatch {
        field: field.name.clone(),
        expected: field.ty.label(),
        actual: value.kind(),
    })
}

#[cfg(test)]
mod tests {
    use super::{
        quote_ident, render_count, render_delete, render_insert, render_restore, render_select,
        render_update, scan_placeholders, Placeholders, Shape,
    };
    use crate::engine::policy::{ConflictResolution, DeleteMode};
    use crate::model::{FieldDescriptor, FieldType, ModelDescriptor, Value};
    use crate::query::{
        AggregateFn, Assignments, Condition, Fetch, QueryError, QueryPlan, SelectItem, UpdateOp,
    };
    use std::sync::Arc;

    fn users() -> QueryPlan {
        QueryPlan::new(Arc::new(
            ModelDescriptor::builder("User")
                .standard_fields()
                .field(FieldDescriptor::new("name", FieldType::Text))
                .field(FieldDescriptor::new("age", FieldType::Integer).default_value(18))
                .build()
                .unwrap(),
        ))
    }

    #[test]
    fn quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    fn slots(sql: &str) -> usize {
        scan_placeholders(sql).slots
    }

    #[test]
    fn placeholders_inside_literals_are_ignored() {
        assert_eq!(slots("name = ? AND note <> '?'"), 1);
        assert_eq!(slots("\"odd?\" = ? OR age > ?"), 2);
        assert_eq!(slots("note = 'it''s ?' AND [x?] = ? AND `y?` = ?"), 2);
    }

    #[test]
    fn placeholders_inside_comments_are_ignored() {
        assert_eq!(slots("SELECT ? -- trailing ?\n, ?"), 2);
        assert_eq!(slots("SELECT /* ? :skip */ ?"), 1);
        assert_eq!(slots("SELECT ? /* unterminated ?"), 1);
    }

    #[test]
    fn numbered_and_named_placeholders_follow_sqlite_numbering() {
        assert_eq!(
            scan_placeholders("SELECT ?1 AS a, ?1 AS b"),
            Placeholders {
                slots: 1,
                explicit: true
            }
        );
        assert_eq!(slots("SELECT ?2, ?"), 3);
        assert_eq!(slots("SELECT :name, @name, :name, $other"), 3);
        assert_eq!(slots("SELECT price$usd FROM t WHERE a = ?"), 1);
        assert!(!scan_placeholders("age > ? AND x = ?").explicit);
    }

    #[test]
    fn fragments_reject_explicit_placeholders() {
        let plan = users().filter(Condition::raw("age > ?1", vec![Value::from(3)]));
        assert_eq!(
            render_select(&plan, Fetch::All).unwrap_err(),
            QueryError::FragmentPlaceholder("age > ?1".to_string())
        );
    }

    #[test]
    fn select_applies_visibility_and_ordering() {
        let plan = users()
            .filter(Condition::eq("Name", "jinzhu"))
            .or(Condition::eq("age", 20))
            .order("age desc, name");
        let (statement, shape) = render_select(&plan, Fetch::All).unwrap();
        assert_eq!(shape, Shape::Records);
        assert_eq!(
            statement.sql,
            "SELECT \"id\", \"created_at\", \"updated_at\", \"deleted_at\", \"name\", \"age\" \
             FROM \"users\" WHERE (\"name\" = ? OR \"age\" = ?) AND \"deleted_at\" IS NULL \
             ORDER BY \"age\" DESC, \"name\" ASC"
        );
        assert_eq!(
            statement.params,
            vec![Value::from("jinzhu"), Value::from(20)]
        );
    }

    #[test]
    fn first_and_last_order_by_primary_key() {
        let (first, _) = render_select(&users().select(["name"]), Fetch::First).unwrap();
        assert!(first.sql.ends_with("ORDER BY \"id\" ASC LIMIT 1"));

        let (last, _) = render_select(&users().unscoped(), Fetch::Last).unwrap();
        assert!(!last.sql.contains("deleted_at\" IS NULL"));
        assert!(last.sql.ends_with("ORDER BY \"id\" DESC LIMIT 1"));
    }

    #[test]
    fn offset_without_limit_is_unbounded() {
        let (statement, _) = render_select(&users().offset(3), Fetch::All).unwrap();
        assert!(statement.sql.ends_with("LIMIT -1 OFFSET 3"));
    }

    #[test]
    fn empty_in_matches_nothing() {
        let plan = users().filter(Condition::is_in("name", Vec::<Value>::new()));
        let (statement, _) = render_select(&plan, Fetch::All).unwrap();
        assert!(statement.sql.contains("WHERE 1 = 0 AND"));
        assert!(statement.params.is_empty());
    }

    #[test]
    fn unknown_fields_and_projection_conflicts_fail() {
        let err = render_select(&users().filter(Condition::eq("nope", 1)), Fetch::All).unwrap_err();
        assert!(matches!(err, QueryError::UnknownField { field, .. } if field == "nope"));

        let err = render_select(&users().select(["name"]).omit(["age"]), Fetch::All).unwrap_err();
        assert_eq!(err, QueryError::ProjectionConflict);

        let err = render_select(&users().order("age; drop table users"), Fetch::All).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOrder(_)));
    }

    #[test]
    fn raw_placeholder_mismatch_is_rejected() {
        let plan = users().filter(Condition::raw("name = ? AND age = ?", ["jinzhu"]));
        let err = render_select(&plan, Fetch::All).unwrap_err();
        assert!(matches!(
            err,
            QueryError::PlaceholderMismatch {
                placeholders: 2,
                params: 1,
                ..
            }
        ));
    }

    #[test]
    fn aggregates_render_with_aliases() {
        let plan = users()
            .select_items(vec![
                SelectItem::field("name"),
                SelectItem::aggregate(AggregateFn::Sum, "age", "total"),
            ])
            .group(["name"])
            .having(Condition::gt("total", 100));
        let (statement, shape) = render_select(&plan, Fetch::All).unwrap();
        assert_eq!(shape, Shape::Rows);
        assert_eq!(
            statement.sql,
            "SELECT \"name\", SUM(\"age\") AS \"total\" FROM \"users\" \
             WHERE \"deleted_at\" IS NULL GROUP BY \"name\" HAVING \"total\" > ?"
        );

        let scalar = users().select_items(vec![SelectItem::count_all("n")]);
        assert_eq!(render_select(&scalar, Fetch::All).unwrap().1, Shape::Scalar);
        assert!(render_select(&scalar, Fetch::First).is_err());
    }

    #[test]
    fn count_wraps_distinct_projection() {
        let simple = render_count(&users().filter(Condition::ge("age", 18)).limit(2)).unwrap();
        assert_eq!(
            simple.sql,
            "SELECT COUNT(*) FROM \"users\" WHERE \"age\" >= ? AND \"deleted_at\" IS NULL"
        );

        let distinct = render_count(&users().distinct(["name"])).unwrap();
        assert_eq!(
            distinct.sql,
            "SELECT COUNT(*) FROM (SELECT DISTINCT \"name\" FROM \"users\" WHERE \"deleted_at\" IS NULL)"
        );
    }

    #[test]
    fn update_binds_sets_before_where_and_touches_updated_at() {
        let plan = users().target(7);
        let op = UpdateOp {
            assignments: Assignments::new()
                .set("name", "hello")
                .expr("age", "age * ? + ?", [2, 100]),
            touch: true,
        };
        let statement = render_update(&plan, &op, 1_000).unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"users\" SET \"name\" = ?, \"age\" = (age * ? + ?), \"updated_at\" = ? \
             WHERE \"id\" = ? AND \"deleted_at\" IS NULL"
        );
        assert_eq!(
            statement.params,
            vec![
                Value::from("hello"),
                Value::from(2),
                Value::from(100),
                Value::Integer(1_000),
                Value::from(7),
            ]
        );
    }

    #[test]
    fn update_rejects_primary_key_and_type_mismatch() {
        let op = |assignments| UpdateOp {
            assignments,
            touch: false,
        };
        let err = render_update(&users(), &op(Assignments::new().set("id", 2)), 0).unwrap_err();
        assert_eq!(err, QueryError::ImmutableField("id".to_string()));

        let err = render_update(&users(), &op(Assignments::new().set("age", "old")), 0).unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { .. }));

        let err = render_update(&users(), &op(Assignments::new()), 0).unwrap_err();
        assert_eq!(err, QueryError::EmptyUpdate);
    }

    #[test]
    fn delete_modes_render_differently() {
        let plan = users().filter(Condition::eq("name", "jinzhu"));
        let logical = render_delete(
            &plan,
            &DeleteMode::Logical {
                field: "deleted_at".to_string(),
            },
            5,
        )
        .unwrap();
        assert_eq!(
            logical.sql,
            "UPDATE \"users\" SET \"deleted_at\" = ? WHERE \"name\" = ? AND \"deleted_at\" IS NULL"
        );
        assert_eq!(logical.params, vec![Value::Integer(5), Value::from("jinzhu")]);

        let physical = render_delete(&plan, &DeleteMode::Physical, 5).unwrap();
        assert_eq!(physical.sql, "DELETE FROM \"users\" WHERE \"name\" = ?");

        let restore = render_restore(&plan).unwrap();
        assert_eq!(
            restore.sql,
            "UPDATE \"users\" SET \"deleted_at\" = NULL WHERE \"name\" = ? AND \"deleted_at\" IS NOT NULL"
        );
    }

    #[test]
    fn insert_renders_conflict_clauses() {
        let plan = users();
        let model = plan.model();
        let name = model.field("name").unwrap();
        let row = vec![(name, Value::from("jinzhu"))];

        let raise = render_insert(model, &row, &ConflictResolution::Raise);
        assert_eq!(
            raise.sql,
            "INSERT INTO \"users\" (\"name\") VALUES (?) RETURNING \"id\", \"deleted_at\""
        );
        let skip = render_insert(model, &row, &ConflictResolution::Skip);
        assert!(skip.sql.contains("ON CONFLICT DO NOTHING RETURNING"));
        let merge = render_insert(
            model,
            &row,
            &ConflictResolution::Merge(vec!["name".to_string()]),
        );
        assert!(merge
            .sql
            .contains("ON CONFLICT DO UPDATE SET \"name\" = excluded.\"name\" RETURNING"));

        let defaults = render_insert(model, &[], &ConflictResolution::Skip);
        assert_eq!(
            defaults.sql,
            "INSERT INTO \"users\" DEFAULT VALUES RETURNING \"id\", \"deleted_at\""
        );
    }
}
