use rowmap_core::{
    from_typed, Assignments, Condition, Engine, FieldDescriptor, FieldType, ModelDescriptor,
    QueryPlan, RecordState, SchemaRegistry, SqliteStorage, StoreConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct User {
    #[serde(default)]
    id: i64,
    name: String,
    #[serde(default)]
    age: i64,
}

#[test]
fn user_round_trip_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        dsn: format!("sqlite:{}", dir.path().join("gorm.db").display()),
        ..StoreConfig::default()
    };
    let mut storage = SqliteStorage::open(&config).unwrap();
    let engine = Engine::from_config(&config);
    let mut registry = SchemaRegistry::new();
    let model = registry.register(user_model());
    registry.reconcile_all(&mut storage).unwrap();
    let users = QueryPlan::new(model.clone());

    let mut rachel = from_typed(
        &model,
        &User {
            id: 0,
            name: "Rachel".to_string(),
            age: 24,
        },
    )
    .unwrap();
    engine.create(&mut storage, &users, &mut rachel).unwrap();
    assert_eq!(rachel.state(), RecordState::Active);

    let by_name = users.filter(Condition::eq("name", "Rachel"));
    let found = engine.find(&mut storage, &by_name).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get_i64("age"), Some(24));

    engine
        .update_record(
            &mut storage,
            &users,
            &mut rachel,
            Assignments::new().set("age", 25),
        )
        .unwrap();
    let typed: Vec<User> = engine.find_as(&mut storage, &by_name).unwrap();
    assert_eq!(
        typed,
        vec![User {
            id: 1,
            name: "Rachel".to_string(),
            age: 25,
        }]
    );

    engine
        .delete_record(&mut storage, &users, &mut rachel, false)
        .unwrap();
    assert!(engine.find(&mut storage, &by_name).unwrap().is_empty());

    let hidden = engine.find(&mut storage, &by_name.unscoped()).unwrap();
    assert_eq!(hidden.len(), 1);
    assert_eq!(hidden[0].state(), RecordState::SoftDeleted);
    assert!(hidden[0].deleted_at().is_some());
}

#[test]
fn omitted_field_takes_declared_default() {
    let mut storage = SqliteStorage::open_in_memory().unwrap();
    let mut registry = SchemaRegistry::new();
    let model = registry.register(user_model());
    registry.reconcile(&mut storage, "User").unwrap();
    let users = QueryPlan::new(model.clone());
    let engine = Engine::default();

    let mut jinzhu = from_typed(
        &model,
        &User {
            id: 0,
            name: "jinzhu".to_string(),
            age: 0,
        },
    )
    .unwrap();
    engine.create(&mut storage, &users, &mut jinzhu).unwrap();
    assert_eq!(jinzhu.get_i64("age"), Some(18));

    let stored: User = engine.first_as(&mut storage, &users).unwrap();
    assert_eq!(stored.age, 18);
}

#[test]
fn permanent_delete_removes_row_from_every_read() {
    let mut storage = SqliteStorage::open_in_memory().unwrap();
    let mut registry = SchemaRegistry::new();
    let model = registry.register(user_model());
    registry.reconcile_all(&mut storage).unwrap();
    let users = QueryPlan::new(model.clone());
    let engine = Engine::default();

    let mut record = from_typed(
        &model,
        &User {
            id: 0,
            name: "Rachel".to_string(),
            age: 24,
        },
    )
    .unwrap();
    engine.create(&mut storage, &users, &mut record).unwrap();
    engine
        .delete_record(&mut storage, &users, &mut record, true)
        .unwrap();

    assert_eq!(engine.count(&mut storage, &users).unwrap(), 0);
    assert_eq!(engine.count(&mut storage, &users.unscoped()).unwrap(), 0);
}

fn user_model() -> ModelDescriptor {
    ModelDescriptor::builder("User")
        .standard_fields()
        .field(FieldDescriptor::new("name", FieldType::Text))
        .field(FieldDescriptor::new("age", FieldType::Integer).default_value(18))
        .build()
        .unwrap()
}
