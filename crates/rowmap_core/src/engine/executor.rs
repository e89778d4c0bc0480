//! Plan execution against a storage.

use super::policy::{conflict_resolution, delete_mode, ConflictPolicy, DeleteMode};
use super::{BatchOutcome, EngineError, EngineResult, ExecutionResult, RecordOutcome};
use crate::config::StoreConfig;
use crate::db::{DbError, RowSet, Statement, Storage};
use crate::mapper::{records_from_rows, selected_fields, to_row, to_typed};
use crate::model::{
    now_epoch_ms, FieldDescriptor, FieldRole, ModelDescriptor, Record, RecordState, Value,
};
use crate::query::sql::{
    check_placeholders, render_count, render_delete, render_insert, render_restore,
    render_select, render_update, Shape,
};
use crate::query::{
    Assignments, Condition, DeleteOp, Direction, Fetch, InsertOptions, Operation, OperationKind,
    QueryError, QueryPlan, SelectItem, UpdateOp,
};
use log::{debug, error, info, trace, warn};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Instant;

const RAW_MODEL: &str = "raw";

/// Engine-wide switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Lets unconditioned update/delete/restore plans run.
    pub allow_global_mutation: bool,
}

impl From<&StoreConfig> for EngineOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            allow_global_mutation: config.allow_global_mutation,
        }
    }
}

/// Stateless plan executor.
///
/// The engine holds no connection; every call borrows the storage it runs
/// against, so one engine can serve any number of storages.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    options: EngineOptions,
}

/// Insert result awaiting commit before it is applied to the record.
struct PendingInsert {
    outcome: RecordOutcome,
    written: Vec<(String, Value)>,
    /// Soft-delete marker of the stored row after the write.
    deleted_at: Option<i64>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(EngineOptions::from(config))
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Executes `plan` according to its operation.
    ///
    /// Insert plans work on copies of their records; the persisted copies
    /// come back in [`ExecutionResult::Inserted`].
    pub fn execute<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<ExecutionResult> {
        match plan.operation() {
            Operation::Select(Fetch::Count) => {
                Ok(ExecutionResult::Scalar(Value::Integer(self.count(storage, plan)?)))
            }
            Operation::Select(fetch) => self.select(storage, plan, *fetch),
            Operation::Insert(op) => {
                let mut records = op.records.clone();
                let outcome = self.insert_records(storage, plan, &mut records, &op.options)?;
                Ok(ExecutionResult::Inserted { records, outcome })
            }
            Operation::Update(op) => self
                .run_update(storage, plan, op)
                .map(ExecutionResult::Affected),
            Operation::Delete(op) => self
                .run_delete(storage, plan, *op)
                .map(ExecutionResult::Affected),
            Operation::Restore => self
                .run_restore(storage, plan)
                .map(ExecutionResult::Affected),
        }
    }

    // ---- reads ----

    /// Every visible record matching the plan.
    pub fn find<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<Vec<Record>> {
        match self.select(storage, plan, Fetch::All)? {
            ExecutionResult::Records(records) => Ok(records),
            _ => Err(QueryError::InvalidSelect(
                "projection does not map to records".to_string(),
            )
            .into()),
        }
    }

    /// First match by primary key ascending; `NotFound` when none.
    pub fn first<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<Record> {
        self.fetch_one(storage, plan, Fetch::First)
    }

    /// Any one match, no implied order; `NotFound` when none.
    pub fn take<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<Record> {
        self.fetch_one(storage, plan, Fetch::Take)
    }

    /// Last match by primary key; `NotFound` when none.
    pub fn last<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<Record> {
        self.fetch_one(storage, plan, Fetch::Last)
    }

    /// Number of visible matches; order, limit and offset are ignored.
    pub fn count<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<i64> {
        let statement = render_count(plan)?;
        let rows = self.run(storage, OperationKind::Select, plan.model().name(), &statement)?;
        Ok(rows.scalar().and_then(Value::as_i64).unwrap_or(0))
    }

    /// Value of a single-aggregate projection such as `SUM(age)`.
    pub fn scalar<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<Value> {
        match self.select(storage, plan, Fetch::All)? {
            ExecutionResult::Scalar(value) => Ok(value),
            _ => Err(QueryError::InvalidSelect(
                "projection is not a single ungrouped aggregate".to_string(),
            )
            .into()),
        }
    }

    /// Matches as `column -> value` maps, for grouped or mixed projections.
    pub fn rows<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<Vec<BTreeMap<String, Value>>> {
        let (statement, _) = render_select(plan, Fetch::All)?;
        let rows = self.run(storage, OperationKind::Select, plan.model().name(), &statement)?;
        Ok(rows.to_maps())
    }

    /// One field of every match, in row order.
    pub fn pluck<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        field: &str,
    ) -> EngineResult<Vec<Value>> {
        let descriptor = plan
            .model()
            .field(field)
            .ok_or_else(|| QueryError::UnknownField {
                model: plan.model().name().to_string(),
                field: field.to_string(),
            })?;
        let (statement, _) = render_select(&plan.select([field]), Fetch::All)?;
        let rows = self.run(storage, OperationKind::Select, plan.model().name(), &statement)?;
        rows.rows
            .into_iter()
            .map(|row| {
                let raw = row.into_iter().next().unwrap_or(Value::Null);
                let kind = raw.kind();
                raw.coerce(descriptor.ty).ok_or_else(|| {
                    QueryError::TypeMismatch {
                        field: descriptor.name.clone(),
                        expected: descriptor.ty.label(),
                        actual: kind,
                    }
                    .into()
                })
            })
            .collect()
    }

    /// [`Self::find`] deserialized into `T`.
    pub fn find_as<T: DeserializeOwned, S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<Vec<T>> {
        let records = self.find(storage, plan)?;
        records
            .iter()
            .map(|record| to_typed(plan.model(), record).map_err(EngineError::from))
            .collect()
    }

    /// [`Self::first`] deserialized into `T`.
    pub fn first_as<T: DeserializeOwned, S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<T> {
        let record = self.first(storage, plan)?;
        Ok(to_typed(plan.model(), &record)?)
    }

    /// Walks matches in primary-key order, `batch_size` at a time.
    ///
    /// Pages by key rather than offset, so rows inserted behind the cursor
    /// are not revisited. The plan's own order, limit and offset are
    /// replaced. Returns the number of records visited.
    pub fn find_in_batches<S, F>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        batch_size: u64,
        mut visit: F,
    ) -> EngineResult<usize>
    where
        S: Storage + ?Sized,
        F: FnMut(&[Record]) -> EngineResult<()>,
    {
        if batch_size == 0 {
            return Err(QueryError::InvalidSelect("batch size must be positive".to_string()).into());
        }
        let key_field = plan.model().primary_key().name.clone();
        let mut base = plan.clone();
        base.order.clear();
        base.offset = None;
        let base = base
            .order_by(key_field.as_str(), Direction::Asc)
            .limit(batch_size);

        let mut cursor: Option<Value> = None;
        let mut visited = 0;
        loop {
            let page = match &cursor {
                Some(key) => base.filter(Condition::gt(key_field.as_str(), key.clone())),
                None => base.clone(),
            };
            let records = self.find(storage, &page)?;
            let Some(last) = records.last() else {
                break;
            };
            cursor = Some(last.primary_key().cloned().ok_or_else(|| {
                QueryError::InvalidSelect(
                    "batched fetch needs the primary key in the projection".to_string(),
                )
            })?);
            visited += records.len();
            visit(&records)?;
            if (records.len() as u64) < batch_size {
                break;
            }
        }
        Ok(visited)
    }

    /// First structural match of `conditions`, or an unsaved record built
    /// from `conditions` overlaid with `attrs`.
    pub fn first_or_init<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        conditions: &Record,
        attrs: &Record,
    ) -> EngineResult<Record> {
        match self.first(storage, &plan.filter(Condition::matching(conditions))) {
            Ok(found) => Ok(found),
            Err(err) if err.is_not_found() => {
                let mut fresh = Record::from_pairs(conditions.values().clone());
                for (field, value) in attrs.values() {
                    fresh.set(field.as_str(), value.clone());
                }
                Ok(fresh)
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`Self::first_or_init`], but persists the initialized record.
    pub fn first_or_create<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        conditions: &Record,
        attrs: &Record,
    ) -> EngineResult<Record> {
        let mut record = self.first_or_init(storage, plan, conditions, attrs)?;
        if record.state() == RecordState::Unpersisted {
            self.create(storage, plan, &mut record)?;
        }
        Ok(record)
    }

    /// Children of `parent` through the child's belongs-to field.
    ///
    /// # Errors
    /// - `NotPersisted` when `parent` has no stored row.
    /// - `Query(Unsupported)` when the child model declares no reference to
    ///   the parent's table.
    pub fn related<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        parent_plan: &QueryPlan,
        parent: &Record,
        child_plan: &QueryPlan,
    ) -> EngineResult<Vec<Record>> {
        let parent_model = parent_plan.model();
        let key = persisted_key(parent_model, parent)?;
        let link = child_plan
            .model()
            .reference_to(parent_model.table())
            .ok_or_else(|| {
                QueryError::Unsupported(format!(
                    "model `{}` has no reference to `{}`",
                    child_plan.model().name(),
                    parent_model.table()
                ))
            })?;
        let target = link
            .references
            .as_ref()
            .map(|target| target.column.as_str())
            .unwrap_or_default();
        let value = if target.eq_ignore_ascii_case(&parent_model.primary_key().column) {
            key
        } else {
            parent_model
                .field_by_column(target)
                .and_then(|field| parent.get(&field.name))
                .cloned()
                .unwrap_or(Value::Null)
        };
        self.find(
            storage,
            &child_plan.filter(Condition::eq(link.name.as_str(), value)),
        )
    }

    // ---- inserts ----

    /// Inserts one record; the plan's `select`/`omit` narrows the columns.
    pub fn create<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        record: &mut Record,
    ) -> EngineResult<RecordOutcome> {
        let outcome = self.insert_records(
            storage,
            plan,
            std::slice::from_mut(record),
            &InsertOptions::default(),
        )?;
        Ok(outcome
            .outcomes
            .into_iter()
            .next()
            .unwrap_or(RecordOutcome::Skipped))
    }

    /// Inserts all records atomically with the default conflict policy.
    pub fn create_batch<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        records: &mut [Record],
    ) -> EngineResult<BatchOutcome> {
        self.insert_records(storage, plan, records, &InsertOptions::default())
    }

    /// Inserts with an explicit conflict policy and error mode.
    pub fn create_with<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        records: &mut [Record],
        options: &InsertOptions,
    ) -> EngineResult<BatchOutcome> {
        self.insert_records(storage, plan, records, options)
    }

    fn insert_records<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        records: &mut [Record],
        options: &InsertOptions,
    ) -> EngineResult<BatchOutcome> {
        let started_at = Instant::now();
        let model = plan.model();
        let projection = insert_projection(plan)?;
        if let Some(removed) = records
            .iter()
            .find(|record| record.state() == RecordState::Removed)
        {
            return Err(crate::model::RecordError::InvalidTransition {
                from: removed.state(),
                to: RecordState::Active,
            }
            .into());
        }
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let now = now_epoch_ms();
        let total = records.len();
        let owns_transaction = total > 1 && !storage.in_transaction();
        if owns_transaction {
            storage
                .begin_transaction()
                .map_err(|err| wrap_db(OperationKind::Insert.label(), model.name(), err))?;
        }

        let mut pending = Vec::with_capacity(total);
        for (index, record) in records.iter().enumerate() {
            match self.insert_one(storage, model, record, &projection, &options.conflict, now) {
                Ok(done) => pending.push(done),
                Err(err) if options.continue_on_error => {
                    warn!(
                        "event=engine_insert module=engine status=record_failed model={} index={} error={}",
                        model.name(),
                        index,
                        err
                    );
                    pending.push(PendingInsert {
                        outcome: RecordOutcome::Failed {
                            message: err.to_string(),
                        },
                        written: Vec::new(),
                        deleted_at: None,
                    });
                }
                Err(err) => {
                    if owns_transaction {
                        if let Err(rollback_err) = storage.rollback() {
                            error!(
                                "event=engine_insert module=engine status=rollback_failed model={} error={}",
                                model.name(),
                                rollback_err
                            );
                        }
                    }
                    if total == 1 {
                        return Err(err);
                    }
                    return Err(EngineError::BatchAborted {
                        model: model.name().to_string(),
                        failed_index: index,
                        total,
                        source: Box::new(err),
                    });
                }
            }
        }
        if owns_transaction {
            storage
                .commit()
                .map_err(|err| wrap_db(OperationKind::Insert.label(), model.name(), err))?;
        }

        let mut outcome = BatchOutcome::default();
        for (record, done) in records.iter_mut().zip(pending) {
            if let Some(key) = done.outcome.primary_key().cloned() {
                for (field, value) in done.written {
                    record.set(field, value);
                }
                if record.state() == RecordState::Unpersisted {
                    record.mark_persisted(key)?;
                } else {
                    record.assign_primary_key(key)?;
                }
                record.sync_deleted_at(done.deleted_at)?;
            }
            outcome.outcomes.push(done.outcome);
        }

        info!(
            "event=engine_insert module=engine status=ok model={} total={} written={} skipped={} failed={} duration_ms={}",
            model.name(),
            total,
            outcome.written(),
            outcome.skipped(),
            outcome.failed(),
            started_at.elapsed().as_millis()
        );
        Ok(outcome)
    }

    fn insert_one<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        model: &ModelDescriptor,
        record: &Record,
        projection: &[&FieldDescriptor],
        policy: &ConflictPolicy,
        now: i64,
    ) -> EngineResult<PendingInsert> {
        let row = to_row(model, record, projection, now)?;
        let inserted: Vec<&FieldDescriptor> = row.iter().map(|(field, _)| *field).collect();
        let resolution = conflict_resolution(policy, model, &inserted)?;
        let statement = render_insert(model, &row, &resolution);
        let rows = self.run(storage, OperationKind::Insert, model.name(), &statement)?;

        let key_field = model.primary_key();
        let Some(raw_key) = rows.scalar().filter(|key| !key.is_null()).cloned() else {
            return Ok(PendingInsert {
                outcome: RecordOutcome::Skipped,
                written: Vec::new(),
                deleted_at: None,
            });
        };
        let kind = raw_key.kind();
        let primary_key = raw_key
            .coerce(key_field.ty)
            .ok_or_else(|| QueryError::TypeMismatch {
                field: key_field.name.clone(),
                expected: key_field.ty.label(),
                actual: kind,
            })?;
        let outcome = match resolution {
            super::ConflictResolution::Merge(_) => RecordOutcome::Upserted { primary_key },
            _ => RecordOutcome::Inserted { primary_key },
        };
        let written = row
            .into_iter()
            .filter(|(field, _)| !field.is_primary_key() && !field.is_soft_delete())
            .map(|(field, value)| (field.name.clone(), value))
            .collect();
        let deleted_at = model
            .soft_delete_field()
            .and_then(|marker| rows.column_index(&marker.column))
            .and_then(|index| rows.rows.first().and_then(|row| row.get(index)))
            .and_then(Value::as_i64);
        Ok(PendingInsert {
            outcome,
            written,
            deleted_at,
        })
    }

    // ---- bulk mutations ----

    /// Updates matches, stamping the updated-at field.
    pub fn update<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        assignments: Assignments,
    ) -> EngineResult<usize> {
        self.run_update(
            storage,
            plan,
            &UpdateOp {
                assignments,
                touch: true,
            },
        )
    }

    /// Updates matches without touching the updated-at field.
    pub fn update_columns<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        assignments: Assignments,
    ) -> EngineResult<usize> {
        self.run_update(
            storage,
            plan,
            &UpdateOp {
                assignments,
                touch: false,
            },
        )
    }

    /// Deletes matches; soft-delete models are tombstoned.
    pub fn delete<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<usize> {
        self.run_delete(storage, plan, DeleteOp { permanent: false })
    }

    /// Physically removes matches, soft-deleted rows included.
    pub fn delete_permanently<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<usize> {
        self.run_delete(storage, plan, DeleteOp { permanent: true })
    }

    /// Clears the soft-delete marker of soft-deleted matches.
    pub fn restore<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<usize> {
        self.run_restore(storage, plan)
    }

    fn run_update<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        op: &UpdateOp,
    ) -> EngineResult<usize> {
        self.check_scope(plan, OperationKind::Update)?;
        let statement = render_update(plan, op, now_epoch_ms())?;
        let rows = self.run(storage, OperationKind::Update, plan.model().name(), &statement)?;
        Ok(rows.rows_affected)
    }

    fn run_delete<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        op: DeleteOp,
    ) -> EngineResult<usize> {
        self.check_scope(plan, OperationKind::Delete)?;
        let mode = delete_mode(plan.model(), op.permanent);
        let statement = render_delete(plan, &mode, now_epoch_ms())?;
        let rows = self.run(storage, OperationKind::Delete, plan.model().name(), &statement)?;
        Ok(rows.rows_affected)
    }

    fn run_restore<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
    ) -> EngineResult<usize> {
        self.check_scope(plan, OperationKind::Restore)?;
        let statement = render_restore(plan)?;
        let rows = self.run(storage, OperationKind::Restore, plan.model().name(), &statement)?;
        Ok(rows.rows_affected)
    }

    fn check_scope(&self, plan: &QueryPlan, kind: OperationKind) -> EngineResult<()> {
        if plan.is_restricted() || plan.allows_global() || self.options.allow_global_mutation {
            return Ok(());
        }
        warn!(
            "event=engine_execute module=engine status=rejected op={} model={} reason=unconditioned_bulk_mutation",
            kind.label(),
            plan.model().name()
        );
        Err(EngineError::UnsafeBulkOperation {
            op: kind.label(),
            model: plan.model().name().to_string(),
        })
    }

    // ---- record-level operations ----

    /// Updates one persisted record by key, then reloads it.
    pub fn update_record<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        record: &mut Record,
        assignments: Assignments,
    ) -> EngineResult<()> {
        let key = persisted_key(plan.model(), record)?;
        let op = UpdateOp {
            assignments,
            touch: true,
        };
        if self.run_update(storage, &plan.target(key), &op)? == 0 {
            return Err(not_found(plan.model()));
        }
        self.reload(storage, plan, record)
    }

    /// Inserts an unsaved record, or writes every field of a stored one.
    pub fn save<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        record: &mut Record,
    ) -> EngineResult<()> {
        if record.state() == RecordState::Unpersisted {
            return self.create(storage, plan, record).map(|_| ());
        }
        let key = persisted_key(plan.model(), record)?;
        let model = plan.model();
        let assignments = record
            .values()
            .iter()
            .filter(|(field, _)| {
                model
                    .field(field)
                    .is_some_and(|field| field.role != FieldRole::UpdatedAt)
            })
            .fold(Assignments::new(), |acc, (field, value)| {
                acc.set(field.as_str(), value.clone())
            });
        if !assignments.is_empty() {
            let op = UpdateOp {
                assignments,
                touch: true,
            };
            if self.run_update(storage, &plan.unscoped().target(key), &op)? == 0 {
                return Err(not_found(model));
            }
        }
        self.reload(storage, plan, record)
    }

    /// Re-reads a persisted record by key, soft-deleted rows included.
    pub fn reload<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        record: &mut Record,
    ) -> EngineResult<()> {
        let key = persisted_key(plan.model(), record)?;
        let lookup = QueryPlan::new(plan.model_arc()).unscoped().target(key);
        *record = self.take(storage, &lookup)?;
        Ok(())
    }

    /// Deletes one persisted record by key and updates its lifecycle state.
    ///
    /// Soft-deleting an already soft-deleted record is a no-op that keeps
    /// the original timestamp.
    pub fn delete_record<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        record: &mut Record,
        permanent: bool,
    ) -> EngineResult<()> {
        let key = persisted_key(plan.model(), record)?;
        let mode = delete_mode(plan.model(), permanent);
        let now = now_epoch_ms();
        let statement = render_delete(&plan.target(key), &mode, now)?;
        let affected = self
            .run(storage, OperationKind::Delete, plan.model().name(), &statement)?
            .rows_affected;
        match mode {
            DeleteMode::Logical { .. } => {
                if affected == 0 && record.state() != RecordState::SoftDeleted {
                    return Err(not_found(plan.model()));
                }
                record.mark_soft_deleted(now)?;
            }
            DeleteMode::Physical => {
                if affected == 0 {
                    return Err(not_found(plan.model()));
                }
                record.mark_removed()?;
            }
        }
        Ok(())
    }

    /// Restores one soft-deleted record by key.
    pub fn restore_record<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        record: &mut Record,
    ) -> EngineResult<()> {
        let key = persisted_key(plan.model(), record)?;
        let statement = render_restore(&plan.target(key))?;
        let affected = self
            .run(storage, OperationKind::Restore, plan.model().name(), &statement)?
            .rows_affected;
        if affected == 0 && record.state() != RecordState::Active {
            return Err(not_found(plan.model()));
        }
        record.mark_restored()?;
        Ok(())
    }

    // ---- raw SQL and transactions ----

    /// Runs caller-written SQL and returns its rows.
    pub fn raw<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        sql: &str,
        params: Vec<Value>,
    ) -> EngineResult<RowSet> {
        check_placeholders(sql, params.len())?;
        self.run(
            storage,
            OperationKind::Raw,
            RAW_MODEL,
            &Statement::new(sql, params),
        )
    }

    /// Runs caller-written SQL and returns the affected row count.
    pub fn exec<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        sql: &str,
        params: Vec<Value>,
    ) -> EngineResult<usize> {
        Ok(self.raw(storage, sql, params)?.rows_affected)
    }

    /// Runs `work` in one storage transaction; any error rolls it back.
    pub fn transaction<S, T, F>(&self, storage: &mut S, work: F) -> EngineResult<T>
    where
        S: Storage + ?Sized,
        F: FnOnce(&Self, &mut S) -> EngineResult<T>,
    {
        storage
            .begin_transaction()
            .map_err(|err| wrap_db("begin", RAW_MODEL, err))?;
        match work(self, storage) {
            Ok(value) => {
                storage
                    .commit()
                    .map_err(|err| wrap_db("commit", RAW_MODEL, err))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = storage.rollback() {
                    error!(
                        "event=engine_transaction module=engine status=rollback_failed error={}",
                        rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    // ---- internals ----

    fn select<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        fetch: Fetch,
    ) -> EngineResult<ExecutionResult> {
        let (statement, shape) = render_select(plan, fetch)?;
        let rows = self.run(storage, OperationKind::Select, plan.model().name(), &statement)?;
        Ok(match shape {
            Shape::Records => {
                let records = records_from_rows(plan.model(), &rows)?;
                if fetch == Fetch::All {
                    ExecutionResult::Records(records)
                } else {
                    let record = records
                        .into_iter()
                        .next()
                        .ok_or_else(|| not_found(plan.model()))?;
                    ExecutionResult::Record(record)
                }
            }
            Shape::Scalar => ExecutionResult::Scalar(rows.scalar().cloned().unwrap_or(Value::Null)),
            Shape::Rows => ExecutionResult::Rows(rows.to_maps()),
        })
    }

    fn fetch_one<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        plan: &QueryPlan,
        fetch: Fetch,
    ) -> EngineResult<Record> {
        match self.select(storage, plan, fetch)? {
            ExecutionResult::Record(record) => Ok(record),
            _ => Err(QueryError::InvalidSelect(
                "single-record fetch needs a field projection".to_string(),
            )
            .into()),
        }
    }

    fn run<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        kind: OperationKind,
        model: &str,
        statement: &Statement,
    ) -> EngineResult<RowSet> {
        let started_at = Instant::now();
        trace!(
            "event=engine_sql module=engine op={} model={} sql={}",
            kind.label(),
            model,
            statement.sql
        );
        match storage.execute(statement) {
            Ok(rows) => {
                debug!(
                    "event=engine_execute module=engine status=ok op={} model={} rows={} affected={} duration_ms={}",
                    kind.label(),
                    model,
                    rows.len(),
                    rows.rows_affected,
                    started_at.elapsed().as_millis()
                );
                Ok(rows)
            }
            Err(err) => {
                let err = wrap_db(kind.label(), model, err);
                if err.is_constraint_violation() {
                    warn!(
                        "event=engine_execute module=engine status=constraint op={} model={} duration_ms={} error={}",
                        kind.label(),
                        model,
                        started_at.elapsed().as_millis(),
                        err
                    );
                } else {
                    error!(
                        "event=engine_execute module=engine status=error op={} model={} duration_ms={} error={}",
                        kind.label(),
                        model,
                        started_at.elapsed().as_millis(),
                        err
                    );
                }
                Err(err)
            }
        }
    }
}

/// Insert columns selected by the plan's `select`/`omit`.
fn insert_projection(plan: &QueryPlan) -> EngineResult<Vec<&FieldDescriptor>> {
    let select = match &plan.select {
        Some(items) => Some(
            items
                .iter()
                .map(|item| match item {
                    SelectItem::Field(name) => Ok(name.clone()),
                    SelectItem::Aggregate { .. } => Err(QueryError::InvalidSelect(
                        "aggregates cannot be inserted".to_string(),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
    };
    Ok(selected_fields(
        plan.model(),
        select.as_deref(),
        plan.omit.as_deref(),
    )?)
}

fn persisted_key(model: &ModelDescriptor, record: &Record) -> EngineResult<Value> {
    if !record.state().is_persisted() {
        return Err(not_persisted(model));
    }
    record
        .primary_key()
        .cloned()
        .ok_or_else(|| not_persisted(model))
}

fn not_found(model: &ModelDescriptor) -> EngineError {
    EngineError::NotFound {
        model: model.name().to_string(),
    }
}

fn not_persisted(model: &ModelDescriptor) -> EngineError {
    EngineError::NotPersisted {
        model: model.name().to_string(),
    }
}

fn wrap_db(op: &'static str, model: &str, err: DbError) -> EngineError {
    if err.is_constraint_violation() {
        return EngineError::ConstraintViolation {
            op,
            model: model.to_string(),
            message: err.to_string(),
        };
    }
    EngineError::Execution {
        op,
        model: model.to_string(),
        source: err,
    }
}
