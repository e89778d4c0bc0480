//! Demo walk-through of the rowmap core API.
//!
//! # Responsibility
//! - Reconcile a `users` table, then run create/query/update/delete/raw
//!   steps against the store named by `ROWMAP_DSN`.
//! - Print one line per step so a run can be eyeballed quickly.

use log::{error, info, warn};
use rowmap_core::model::{now_epoch_ms, DescriptorError};
use rowmap_core::{
    init_logging, AggregateFn, Assignments, Condition, ConflictPolicy, Direction, Engine,
    EngineResult, FieldDescriptor, FieldType, InsertOptions, ModelDescriptor, QueryPlan, Record,
    SchemaRegistry, ScopeRegistry, SelectItem, SqliteStorage, StoreConfig, Value,
};
use serde::Deserialize;
use std::error::Error;
use std::process::ExitCode;
use std::time::Instant;

/// Narrow read model over `users`.
#[derive(Debug, Deserialize)]
struct ApiUser {
    id: i64,
    name: String,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_run module=cli status=error error={err}");
            eprintln!("rowmap_cli failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let config = StoreConfig::from_env()?;
    init_logging(&config.logging)?;
    let started_at = Instant::now();
    info!(
        "event=cli_run module=cli status=start version={} dsn={}",
        rowmap_core::core_version(),
        config.dsn
    );
    println!("rowmap_core version={}", rowmap_core::core_version());

    let mut storage = SqliteStorage::open(&config)?;
    let engine = Engine::from_config(&config);

    let mut registry = SchemaRegistry::new();
    let users = registry.register(user_model()?);
    let report = registry.reconcile_all(&mut storage)?;
    println!(
        "reconcile created_tables={:?} added_columns={:?}",
        report.created_tables, report.added_columns
    );

    let plan = QueryPlan::new(users);
    create_users(&engine, &mut storage, &plan)?;
    query_users(&engine, &mut storage, &plan)?;
    update_users(&engine, &mut storage, &plan)?;
    delete_users(&engine, &mut storage, &plan)?;
    raw_sql(&engine, &mut storage)?;
    info!(
        "event=cli_run module=cli status=ok duration_ms={}",
        started_at.elapsed().as_millis()
    );
    Ok(())
}

fn user_model() -> Result<ModelDescriptor, DescriptorError> {
    ModelDescriptor::builder("User")
        .standard_fields()
        .field(FieldDescriptor::new("name", FieldType::Text))
        .field(FieldDescriptor::new("age", FieldType::Integer).default_value(18))
        .field(FieldDescriptor::new("birthday", FieldType::Timestamp))
        .build()
}

fn create_users(engine: &Engine, storage: &mut SqliteStorage, plan: &QueryPlan) -> EngineResult<()> {
    let mut phoebe = Record::new()
        .with("name", "Phoebe")
        .with("age", 25)
        .with("birthday", now_epoch_ms());
    let outcome = engine.create(storage, plan, &mut phoebe)?;
    println!("create outcome={outcome:?} state={}", phoebe.state());

    // Only the selected columns are written; age falls back to its default.
    let mut rachel = Record::new().with("name", "Rachel").with("age", 30);
    engine.create(storage, &plan.select(["name", "created_at"]), &mut rachel)?;

    let mut batch: Vec<Record> = [("Monica", 27), ("Ross", 27), ("Chandler", 23), ("Joey", 0)]
        .into_iter()
        .map(|(name, age)| Record::new().with("name", name).with("age", age))
        .collect();
    let outcome = engine.create_batch(storage, plan, &mut batch)?;
    println!("create_batch written={}", outcome.written());

    // Re-sending stored rows merges them instead of failing.
    let upsert = InsertOptions {
        conflict: ConflictPolicy::UpdateAll,
        ..InsertOptions::default()
    };
    let outcome = engine.create_with(storage, plan, &mut batch[..2], &upsert)?;
    println!("upsert written={}", outcome.written());
    Ok(())
}

fn query_users(
    engine: &Engine,
    storage: &mut SqliteStorage,
    plan: &QueryPlan,
) -> Result<(), Box<dyn Error>> {
    let first = engine.first(storage, plan)?;
    let last = engine.last(storage, plan)?;
    let oldest = engine.take(storage, &plan.order_by("age", Direction::Desc))?;
    println!(
        "first={:?} last={:?} oldest={:?}",
        first.get_str("name"),
        last.get_str("name"),
        oldest.get_str("name")
    );

    let by_keys = engine.find(storage, &plan.targets([2, 3, 4]))?;
    println!("find by keys count={}", by_keys.len());

    let filtered = plan
        .filter(Condition::raw("name = ?", ["Rachel"]))
        .or(Condition::eq("age", 23));
    println!("rachel or 23 count={}", engine.count(storage, &filtered)?);

    let excluded = plan.not(Condition::is_in("name", ["Monica", "Chandler"]));
    println!("not monica/chandler count={}", engine.count(storage, &excluded)?);

    let grouped = plan
        .select_items(vec![
            SelectItem::field("name"),
            SelectItem::aggregate(AggregateFn::Sum, "age", "total"),
        ])
        .group(["name"])
        .having(Condition::gt("total", 20))
        .order("total desc");
    for row in engine.rows(storage, &grouped)? {
        println!("group row={row:?}");
    }

    let ordered = plan.distinct(["name", "age"]).order("name, age desc").limit(3);
    println!("distinct page rows={}", engine.rows(storage, &ordered)?.len());

    let api_users: Vec<ApiUser> = engine.find_as(storage, &plan.limit(10))?;
    for user in &api_users {
        println!("api user id={} name={}", user.id, user.name);
    }

    let mut scopes = ScopeRegistry::new();
    scopes.register("older_than_27", |plan| plan.filter(Condition::gt("age", 27)))?;
    let scoped = scopes.apply(plan, &["older_than_27"])?;
    println!("scoped names={:?}", engine.pluck(storage, &scoped, "name")?);

    let lookup = Record::new().with("name", "Gunther");
    let attrs = Record::new().with("age", 40);
    let found = engine.first_or_init(storage, plan, &lookup, &attrs)?;
    println!("first_or_init state={} age={:?}", found.state(), found.get_i64("age"));

    let visited = engine.find_in_batches(storage, plan, 2, |batch| {
        println!("batch size={}", batch.len());
        Ok(())
    })?;
    println!("find_in_batches visited={visited}");
    Ok(())
}

fn update_users(engine: &Engine, storage: &mut SqliteStorage, plan: &QueryPlan) -> EngineResult<()> {
    let mut rachel = engine.first(storage, &plan.filter(Condition::eq("name", "Rachel")))?;
    engine.update_record(
        storage,
        plan,
        &mut rachel,
        Assignments::new().set("name", "Emily"),
    )?;
    println!("renamed to {:?}", rachel.get_str("name"));

    let aged = engine.update_columns(
        storage,
        &plan.filter(Condition::eq("name", "Ross")),
        Assignments::new().expr("age", "age - ?", [2]),
    )?;
    println!("update_columns affected={aged}");

    match engine.update(storage, plan, Assignments::new().set("age", 1)) {
        Ok(affected) => println!("unexpected global update affected={affected}"),
        Err(err) => {
            warn!("event=cli_update module=cli status=rejected error={err}");
            println!("global update rejected: {err}");
        }
    }
    Ok(())
}

fn delete_users(engine: &Engine, storage: &mut SqliteStorage, plan: &QueryPlan) -> EngineResult<()> {
    let mut joey = engine.first(storage, &plan.filter(Condition::eq("name", "Joey")))?;
    engine.delete_record(storage, plan, &mut joey, false)?;
    println!("soft deleted state={}", joey.state());

    let hidden = engine.count(storage, &plan.filter(Condition::eq("name", "Joey")))?;
    let kept = engine.count(
        storage,
        &plan.unscoped().filter(Condition::eq("name", "Joey")),
    )?;
    println!("joey visible={hidden} unscoped={kept}");

    engine.restore_record(storage, plan, &mut joey)?;
    println!("restored state={}", joey.state());

    let removed = engine.delete_permanently(storage, &plan.filter(Condition::eq("age", 23)))?;
    println!("permanently deleted={removed}");
    Ok(())
}

fn raw_sql(engine: &Engine, storage: &mut SqliteStorage) -> EngineResult<()> {
    let rows = engine.raw(
        storage,
        "SELECT id, name, age FROM users WHERE name = ?",
        vec![Value::from("Monica")],
    )?;
    for row in rows.to_maps() {
        println!("raw row={row:?}");
    }
    let touched = engine.exec(
        storage,
        "UPDATE users SET age = age + ? WHERE deleted_at IS NULL AND name = ?",
        vec![Value::from(1), Value::from("Monica")],
    )?;
    println!("exec affected={touched}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{create_users, delete_users, query_users, raw_sql, update_users, user_model};
    use rowmap_core::{Engine, QueryPlan, SchemaRegistry, SqliteStorage};

    #[test]
    fn walk_through_runs_against_memory_store() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let mut registry = SchemaRegistry::new();
        let plan = QueryPlan::new(registry.register(user_model().unwrap()));
        registry.reconcile_all(&mut storage).unwrap();
        let engine = Engine::default();

        create_users(&engine, &mut storage, &plan).unwrap();
        query_users(&engine, &mut storage, &plan).unwrap();
        update_users(&engine, &mut storage, &plan).unwrap();
        delete_users(&engine, &mut storage, &plan).unwrap();
        raw_sql(&engine, &mut storage).unwrap();
    }
}
