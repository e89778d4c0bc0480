use rowmap_core::db::{SqliteStorage, Statement, Storage};
use rowmap_core::query::QueryError;
use rowmap_core::{
    Engine, EngineError, FieldDescriptor, FieldType, ModelDescriptor, QueryPlan, Record,
    SchemaRegistry, Value,
};

#[test]
fn reconcile_declares_foreign_keys() {
    let (mut storage, _, _) = setup();
    let rows = storage
        .execute(&Statement::new(
            "SELECT \"table\", \"from\", \"to\" FROM pragma_foreign_key_list('messages') ORDER BY \"from\"",
            Vec::new(),
        ))
        .unwrap();
    assert_eq!(
        rows.rows,
        vec![
            vec![
                Value::from("channels"),
                Value::from("channel_id"),
                Value::from("id")
            ],
            vec![Value::from("users"), Value::from("user_id"), Value::from("id")],
        ]
    );
}

#[test]
fn dangling_reference_is_a_constraint_violation() {
    let (mut storage, engine, plans) = setup();
    let mut general = Record::new().with("name", "General");
    engine
        .create(&mut storage, &plans.channels, &mut general)
        .unwrap();

    let mut orphan = message("lost", 42, general.primary_key().unwrap().clone());
    let err = engine
        .create(&mut storage, &plans.messages, &mut orphan)
        .unwrap_err();
    assert!(err.is_constraint_violation());
}

#[test]
fn related_returns_children_of_one_parent() {
    let (mut storage, engine, plans) = setup();
    let mut users = vec![
        Record::new().with("name", "Joe"),
        Record::new().with("name", "Bob"),
    ];
    engine
        .create_batch(&mut storage, &plans.users, &mut users)
        .unwrap();
    let mut channels = vec![
        Record::new().with("name", "General"),
        Record::new().with("name", "Suggestions"),
    ];
    engine
        .create_batch(&mut storage, &plans.channels, &mut channels)
        .unwrap();

    let joe = users[0].primary_key().unwrap().clone();
    let bob = users[1].primary_key().unwrap().clone();
    let general = channels[0].primary_key().unwrap().clone();
    let suggestions = channels[1].primary_key().unwrap().clone();
    let mut messages = vec![
        message("hello!", joe.clone(), general.clone()),
        message("What's up", bob, general),
        message("Make more videos", joe, suggestions),
    ];
    engine
        .create_batch(&mut storage, &plans.messages, &mut messages)
        .unwrap();

    let from_joe = engine
        .related(
            &mut storage,
            &plans.users,
            &users[0],
            &plans.messages.order("id"),
        )
        .unwrap();
    assert_eq!(contents(&from_joe), vec!["hello!", "Make more videos"]);

    let in_general = engine
        .related(&mut storage, &plans.channels, &channels[0], &plans.messages)
        .unwrap();
    assert_eq!(in_general.len(), 2);
}

#[test]
fn related_needs_a_stored_parent_and_a_link() {
    let (mut storage, engine, plans) = setup();
    let unsaved = Record::new().with("name", "Joe");
    let err = engine
        .related(&mut storage, &plans.users, &unsaved, &plans.messages)
        .unwrap_err();
    assert!(matches!(err, EngineError::NotPersisted { .. }));

    let mut general = Record::new().with("name", "General");
    engine
        .create(&mut storage, &plans.channels, &mut general)
        .unwrap();
    let err = engine
        .related(&mut storage, &plans.channels, &general, &plans.users)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Query(QueryError::Unsupported(_))
    ));
}

struct Plans {
    users: QueryPlan,
    channels: QueryPlan,
    messages: QueryPlan,
}

fn setup() -> (SqliteStorage, Engine, Plans) {
    let mut storage = SqliteStorage::open_in_memory().unwrap();
    let mut registry = SchemaRegistry::new();
    let channels = registry.register(
        ModelDescriptor::builder("Channel")
            .standard_fields()
            .field(FieldDescriptor::new("name", FieldType::Text))
            .build()
            .unwrap(),
    );
    let users = registry.register(
        ModelDescriptor::builder("User")
            .standard_fields()
            .field(FieldDescriptor::new("name", FieldType::Text))
            .build()
            .unwrap(),
    );
    let messages = registry.register(
        ModelDescriptor::builder("Message")
            .standard_fields()
            .field(FieldDescriptor::new("content", FieldType::Text))
            .field(
                FieldDescriptor::new("user_id", FieldType::Integer)
                    .not_null()
                    .references("users", "id"),
            )
            .field(
                FieldDescriptor::new("channel_id", FieldType::Integer)
                    .not_null()
                    .references("channels", "id"),
            )
            .build()
            .unwrap(),
    );
    registry.reconcile_all(&mut storage).unwrap();
    let plans = Plans {
        users: QueryPlan::new(users),
        channels: QueryPlan::new(channels),
        messages: QueryPlan::new(messages),
    };
    (storage, Engine::default(), plans)
}

fn message(content: &str, user_id: impl Into<Value>, channel_id: impl Into<Value>) -> Record {
    Record::new()
        .with("content", content)
        .with("user_id", user_id)
        .with("channel_id", channel_id)
}

fn contents(records: &[Record]) -> Vec<&str> {
    records
        .iter()
        .map(|record| record.get_str("content").unwrap())
        .collect()
}
