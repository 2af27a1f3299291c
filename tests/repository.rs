use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metacatalog::datatype::{AttributeDefinition, DataType, HierarchicalTypeDefinition, TypesDef};
use metacatalog::identity::Id;
use metacatalog::indexer::GraphIndexer;
use metacatalog::instance::{Instance, Referenceable, Struct, TypedInstance, TypedStruct, Value};
use metacatalog::listener::{EntityChangeListener, TypesChangeListener};
use metacatalog::{Catalog, CatalogError, Result};

fn setup() -> Catalog {
    let catalog = Catalog::in_memory().expect("catalog");
    let defs = TypesDef::new(
        vec![],
        vec![],
        vec![
            HierarchicalTypeDefinition::new("PII", &[], vec![]),
            HierarchicalTypeDefinition::new("Classification", &[], vec![AttributeDefinition::optional("level", "string")]),
        ],
        vec![
            HierarchicalTypeDefinition::new("Database", &[], vec![AttributeDefinition::required("name", "string").unique()]),
            HierarchicalTypeDefinition::new("Column", &[], vec![
                AttributeDefinition::required("name", "string"),
                AttributeDefinition::optional("dataType", "string"),
            ]),
            HierarchicalTypeDefinition::new("Table", &[], vec![
                AttributeDefinition::required("name", "string"),
                AttributeDefinition::optional("rows", "long"),
                AttributeDefinition::optional("db", "Database"),
                AttributeDefinition::collection("columns", "array<Column>").composite(),
            ]),
        ],
    );
    catalog.metadata().create_type(&defs.to_json().expect("json")).expect("fixture types");
    catalog
}

fn create(catalog: &Catalog, raw: Referenceable) -> Result<String> {
    let typed = catalog.registry().snapshot()?.convert_instance(&raw)?;
    Ok(catalog.repository().create_entity(&typed)?.id().to_string())
}

fn sales_table() -> Referenceable {
    Referenceable::new("Table")
        .with("name", "sales")
        .with("rows", 10)
        .with("db", Referenceable::new("Database").with("name", "warehouse"))
        .with(
            "columns",
            vec![
                Referenceable::new("Column").with("name", "id").with("dataType", "int"),
                Referenceable::new("Column").with("name", "amount").with("dataType", "decimal"),
            ],
        )
        .with_trait_name("PII")
}

#[test]
fn nested_instances_are_created_with_their_owner() {
    let catalog = setup();
    let guid = create(&catalog, sales_table()).expect("create");
    let repository = catalog.repository();
    assert_eq!(repository.get_entity_list("Table").expect("tables"), vec![guid.clone()]);
    assert_eq!(repository.get_entity_list("Column").expect("columns").len(), 2);
    assert_eq!(repository.get_entity_list("Database").expect("databases").len(), 1);

    let table = repository.get_entity_definition(&guid).expect("read back");
    assert!(table.id.is_assigned());
    assert_eq!(table.get("rows").expect("rows"), &Value::Long(10));
    assert_eq!(table.trait_names(), vec!["PII"]);
    // composite children come back whole and in order, plain references as ids
    match table.get("columns").expect("columns") {
        Value::Array(columns) => {
            let names: Vec<_> = columns
                .iter()
                .map(|c| match c {
                    Value::Instance(column) => column.get("name").expect("name").to_string(),
                    other => panic!("expected a column instance, got {other:?}"),
                })
                .collect();
            assert_eq!(names, vec!["id", "amount"]);
        }
        other => panic!("expected columns, got {other:?}"),
    }
    assert!(matches!(table.get("db").expect("db"), Value::Id(id) if id.type_name() == "Database"));
}

#[test]
fn existing_entities_are_referenced_not_copied() {
    let catalog = setup();
    let db = create(&catalog, Referenceable::new("Database").with("name", "lake")).expect("db");
    let table = Referenceable::new("Table")
        .with("name", "events")
        .with("db", Id::new(db.clone(), 0, "Database"));
    let guid = create(&catalog, table).expect("table");
    assert_eq!(catalog.repository().get_entity_list("Database").expect("databases"), vec![db.clone()]);
    let read = catalog.repository().get_entity_definition(&guid).expect("read");
    assert_eq!(read.get("db").expect("db").as_id().map(|id| id.id().to_string()), Some(db));

    let dangling = Referenceable::new("Table")
        .with("name", "ghost")
        .with("db", Id::new("6f1c1c8e-5d4f-4c4a-9a0b-2a6f7f0c2b11", 0, "Database"));
    assert!(matches!(create(&catalog, dangling), Err(CatalogError::EntityNotFound(_))));
}

#[test]
fn an_entity_is_created_once() {
    let catalog = setup();
    let guid = create(&catalog, Referenceable::new("Database").with("name", "one")).expect("db");
    let again = Referenceable::with_id(Id::new(guid, 0, "Database")).with("name", "two");
    assert!(matches!(create(&catalog, again), Err(CatalogError::Repository(_))));
    assert!(matches!(
        catalog.repository().get_entity_definition("no-such-guid"),
        Err(CatalogError::EntityNotFound(_))
    ));
}

#[test]
fn unique_attributes_are_enforced() {
    let catalog = setup();
    create(&catalog, Referenceable::new("Database").with("name", "core")).expect("first");
    let err = create(&catalog, Referenceable::new("Database").with("name", "core")).unwrap_err();
    assert!(matches!(err, CatalogError::UniqueConstraint { ref attribute, .. } if attribute == "name"));

    // clashes inside one batch are caught too, and nothing of the batch is written
    let snapshot = catalog.registry().snapshot().expect("snapshot");
    let batch: Vec<TypedInstance> = ["twin", "twin"]
        .iter()
        .map(|name| snapshot.convert_instance(&Referenceable::new("Database").with("name", *name)).expect("convert"))
        .collect();
    assert!(catalog.repository().create_entities(&batch).is_err());
    assert_eq!(catalog.repository().get_entity_list("Database").expect("databases").len(), 1);

    let other = create(&catalog, Referenceable::new("Database").with("name", "edge")).expect("other");
    assert!(matches!(
        catalog.repository().update_entity(&other, "name", &Value::from("core")),
        Err(CatalogError::UniqueConstraint { .. })
    ));
    // writing an entity's own value back is not a clash
    catalog.repository().update_entity(&other, "name", &Value::from("edge")).expect("same value");
}

#[test]
fn traits_come_and_go() {
    let catalog = setup();
    let guid = create(&catalog, sales_table()).expect("create");
    let metadata = catalog.metadata();
    metadata
        .add_trait(&guid, r#"{"typeName": "Classification", "values": {"level": "secret"}}"#)
        .expect("add trait");
    assert_eq!(metadata.get_trait_names_of(&guid).expect("names"), vec!["PII", "Classification"]);

    let table = catalog.repository().get_entity_definition(&guid).expect("read");
    assert_eq!(table.id.version(), 1);
    let level = table.get_trait("Classification").and_then(|t| t.values().get("level").cloned());
    assert_eq!(level, Some(Value::from("secret")));

    let twice = metadata.add_trait(&guid, r#"{"typeName": "Classification", "values": {}}"#);
    assert!(matches!(twice, Err(CatalogError::Repository(_))));
    assert!(metadata.add_trait(&guid, r#"{"typeName": "Unknown", "values": {}}"#).unwrap_err().is_not_found());

    metadata.delete_trait(&guid, "Classification").expect("delete trait");
    assert_eq!(metadata.get_trait_names_of(&guid).expect("names"), vec!["PII"]);
    assert!(matches!(
        metadata.delete_trait(&guid, "Classification"),
        Err(CatalogError::TraitNotFound { .. })
    ));
    assert!(metadata.delete_trait(&guid, "Unknown").unwrap_err().is_not_found());
    assert_eq!(catalog.repository().get_entity_definition(&guid).expect("read").id.version(), 2);
}

#[test]
fn updates_replace_single_attributes() {
    let catalog = setup();
    let guid = create(&catalog, sales_table()).expect("create");
    let metadata = catalog.metadata();
    metadata.update_entity(&guid, "rows", "250").expect("scalar update");
    metadata.update_entity(&guid, "name", "sales_2024").expect("plain string update");
    let lake = create(&catalog, Referenceable::new("Database").with("name", "lake")).expect("db");
    let reference = format!(r#"{{"id": "{lake}", "typeName": "Database", "version": 0}}"#);
    metadata.update_entity(&guid, "db", &reference).expect("reference update");

    let table = catalog.repository().get_entity_definition(&guid).expect("read");
    assert_eq!(table.get("rows").expect("rows"), &Value::Long(250));
    assert_eq!(table.get("name").expect("name"), &Value::from("sales_2024"));
    assert_eq!(table.get("db").expect("db").as_id().map(|id| id.id().to_string()), Some(lake));

    assert!(matches!(metadata.update_entity(&guid, "columns", "[]"), Err(CatalogError::Repository(_))));
    assert!(matches!(metadata.update_entity(&guid, "nope", "1"), Err(CatalogError::UnknownProperty { .. })));
    assert!(matches!(metadata.update_entity(&guid, "rows", "lots"), Err(CatalogError::ValueConversion { .. })));
}

#[test]
fn metadata_service_round_trips_entities() {
    let catalog = setup();
    let metadata = catalog.metadata();
    let guid = metadata
        .create_entity(
            r#"{"typeName": "Table", "id": "-1", "values": {"name": "orders", "rows": 3,
                "columns": [{"typeName": "Column", "id": "-2", "values": {"name": "sku"}}]},
                "traits": {"PII": {}}}"#,
        )
        .expect("create from json");
    let json: serde_json::Value =
        serde_json::from_str(&metadata.get_entity_definition(&guid).expect("definition")).expect("json");
    assert_eq!(json["id"]["id"], guid.as_str());
    assert_eq!(json["id"]["state"], "ASSIGNED");
    assert_eq!(json["values"]["rows"], 3);
    assert_eq!(json["values"]["columns"][0]["values"]["name"], "sku");
    assert!(json["traits"]["PII"].is_object());

    assert_eq!(metadata.get_entity_list("Table").expect("list"), vec![guid]);
    assert!(metadata.get_entity_list("Nope").unwrap_err().is_not_found());
    assert!(metadata.create_entity(r#"{"values": {}}"#).is_err());
}

#[derive(Default)]
struct Counting {
    entities: AtomicUsize,
    traits_added: AtomicUsize,
    traits_deleted: AtomicUsize,
    types: AtomicUsize,
}
impl EntityChangeListener for Counting {
    fn on_entity_added(&self, instances: &[TypedInstance]) -> Result<()> {
        self.entities.fetch_add(instances.len(), Ordering::SeqCst);
        Ok(())
    }
    fn on_trait_added(&self, _guid: &str, _trait_instance: &TypedStruct) -> Result<()> {
        self.traits_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn on_trait_deleted(&self, _guid: &str, _trait_name: &str) -> Result<()> {
        self.traits_deleted.fetch_add(1, Ordering::SeqCst);
        Err(CatalogError::Repository("listener refused".to_string()))
    }
}
impl TypesChangeListener for Counting {
    fn on_add(&self, _type_name: &str, _data_type: &DataType) -> Result<()> {
        self.types.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn listeners_hear_committed_changes() {
    let catalog = setup();
    let counting = Arc::new(Counting::default());
    let entity_listener: Arc<dyn EntityChangeListener> = counting.clone();
    let types_listener: Arc<dyn TypesChangeListener> = counting.clone();
    catalog.metadata().register_entity_listener(entity_listener.clone()).expect("register");
    catalog.metadata().register_types_listener(types_listener.clone()).expect("register");

    let guid = create(&catalog, sales_table()).expect("create");
    // the table, its database and both columns
    assert_eq!(counting.entities.load(Ordering::SeqCst), 4);

    catalog
        .metadata()
        .add_trait(&guid, &serde_json::to_string(&serde_json::json!({"typeName": "Classification", "values": {}})).expect("json"))
        .expect("add");
    assert_eq!(counting.traits_added.load(Ordering::SeqCst), 1);
    // a failing listener does not undo the change
    catalog.metadata().delete_trait(&guid, "Classification").expect("delete");
    assert_eq!(counting.traits_deleted.load(Ordering::SeqCst), 1);
    assert_eq!(catalog.metadata().get_trait_names_of(&guid).expect("names"), vec!["PII"]);

    let defs = TypesDef::new(vec![], vec![], vec![], vec![
        HierarchicalTypeDefinition::new("View", &[], vec![]),
        HierarchicalTypeDefinition::new("Report", &[], vec![]),
    ]);
    catalog.metadata().create_type(&defs.to_json().expect("json")).expect("types");
    assert_eq!(counting.types.load(Ordering::SeqCst), 2);

    // nothing is heard about a failed batch
    assert!(catalog.metadata().create_type(&defs.to_json().expect("json")).is_err());
    assert_eq!(counting.types.load(Ordering::SeqCst), 2);

    assert!(catalog.metadata().unregister_entity_listener(&entity_listener).expect("unregister"));
    assert!(!catalog.metadata().unregister_entity_listener(&entity_listener).expect("unregister"));
    create(&catalog, Referenceable::new("Database").with("name", "quiet")).expect("create");
    assert_eq!(counting.entities.load(Ordering::SeqCst), 4);
    assert!(catalog.metadata().unregister_types_listener(&types_listener).expect("unregister"));
}

#[test]
fn structs_inside_traits_are_kept() {
    let catalog = setup();
    let guid = create(
        &catalog,
        Referenceable::new("Table")
            .with("name", "audit")
            .with_trait(Struct::new("Classification").with("level", "internal")),
    )
    .expect("create");
    let read = catalog.repository().get_entity_definition(&guid).expect("read");
    assert_eq!(
        read.get_trait("Classification").and_then(|t| t.values().get("level").cloned()),
        Some(Value::from("internal"))
    );
}

#[test]
fn new_types_index_their_scalar_attributes() {
    let catalog = setup();
    let keys = catalog.repository().graph().indexed_keys().expect("keys");
    for key in GraphIndexer::SYSTEM_KEYS {
        assert!(keys.contains(&key.to_string()), "{key} should be indexed");
    }
    for key in ["Database.name", "Table.name", "Table.rows", "Column.dataType", "Classification.level"] {
        assert!(keys.contains(&key.to_string()), "{key} should be indexed");
    }
    // references are edges, not properties
    assert!(!keys.contains(&"Table.db".to_string()));
    assert!(!keys.contains(&"Table.columns".to_string()));
}
