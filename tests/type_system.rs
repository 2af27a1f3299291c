use metacatalog::datatype::{
    AttributeDefinition, EnumTypeDefinition, EnumValue, HierarchicalTypeDefinition, StructTypeDefinition,
    TypeCategory, TypesDef,
};
use metacatalog::registry::TypeRegistry;
use metacatalog::{Catalog, CatalogError};

fn setup() -> TypeRegistry {
    let registry = TypeRegistry::new();
    let defs = TypesDef::new(
        vec![EnumTypeDefinition::new(
            "Level",
            vec![EnumValue::new("LOW", 1), EnumValue::new("HIGH", 2)],
        )],
        vec![StructTypeDefinition::new(
            "Address",
            vec![AttributeDefinition::required("street", "string"), AttributeDefinition::optional("zip", "int")],
        )],
        vec![
            HierarchicalTypeDefinition::new("Classified", &[], vec![AttributeDefinition::optional("tag", "string")]),
            HierarchicalTypeDefinition::new("PII", &["Classified"], vec![AttributeDefinition::optional("level", "Level")]),
        ],
        vec![
            HierarchicalTypeDefinition::new("Person", &[], vec![
                AttributeDefinition::required("name", "string"),
                AttributeDefinition::optional("address", "Address"),
            ]),
            HierarchicalTypeDefinition::new("Manager", &["Person"], vec![
                AttributeDefinition::collection("reports", "array<Person>"),
            ]),
        ],
    );
    registry.define_types(&defs).expect("fixture types");
    registry
}

#[test]
fn batch_defines_every_category() {
    let registry = setup();
    let names = registry.type_names().expect("names");
    for name in ["Level", "Address", "Classified", "PII", "Person", "Manager"] {
        assert!(names.contains(&name.to_string()), "{name} should be registered");
    }
    assert_eq!(registry.trait_names().expect("traits"), vec!["Classified", "PII"]);
    assert_eq!(registry.class_names().expect("classes"), vec!["Person", "Manager"]);
}

#[test]
fn names_shared_across_categories_are_listed_once() {
    let registry = setup();
    let defs = TypesDef::new(
        vec![],
        vec![],
        vec![HierarchicalTypeDefinition::new("Audit", &[], vec![])],
        vec![
            HierarchicalTypeDefinition::new("Ledger", &[], vec![]),
            HierarchicalTypeDefinition::new("Audit", &[], vec![]),
        ],
    );
    registry.define_types(&defs).expect("shared name");
    let names = registry.type_names().expect("names");
    assert_eq!(names.iter().filter(|n| *n == "Audit").count(), 1);
    assert_eq!(names.len(), 8);
    assert!(registry.trait_names().expect("traits").contains(&"Audit".to_string()));
    assert!(registry.class_names().expect("classes").contains(&"Audit".to_string()));
}

#[test]
fn subtypes_flatten_inherited_fields() {
    let registry = setup();
    let catalog = registry.snapshot().expect("snapshot");
    let manager = catalog.require_class("Manager").expect("manager");
    assert_eq!(manager.field_mapping.names(), vec!["name", "address", "reports"]);
    assert_eq!(manager.field_mapping.get("name").map(|a| a.declaring_type.as_str()), Some("Person"));
    assert!(catalog.is_subtype("Manager", "Person"));
    assert!(!catalog.is_subtype("Person", "Manager"));
    assert_eq!(catalog.class_and_subtypes("Person"), vec!["Person", "Manager"]);
    let pii = catalog.require_trait("PII").expect("pii");
    assert!(pii.all_super_types.contains("Classified"));
    assert!(pii.field_mapping.contains("tag"));
}

#[test]
fn failed_batch_leaves_registry_untouched() {
    let registry = setup();
    let before = registry.type_names().expect("names").len();
    // the second class collides with a registered one, so the first must not land either
    let defs = TypesDef::new(vec![], vec![], vec![], vec![
        HierarchicalTypeDefinition::new("Team", &[], vec![AttributeDefinition::required("name", "string")]),
        HierarchicalTypeDefinition::new("Person", &[], vec![]),
    ]);
    let err = registry.define_types(&defs).unwrap_err();
    assert!(matches!(err, CatalogError::DuplicateType { category: TypeCategory::Class, .. }));
    assert!(err.is_type_definition_error());
    assert_eq!(registry.type_names().expect("names").len(), before);
    assert!(!registry.is_registered("Team").expect("lookup"));
}

#[test]
fn unresolved_attribute_types_are_rejected() {
    let registry = setup();
    let defs = TypesDef::new(vec![], vec![], vec![], vec![HierarchicalTypeDefinition::new(
        "Project",
        &[],
        vec![AttributeDefinition::optional("owner", "Nobody")],
    )]);
    match registry.define_types(&defs) {
        Err(CatalogError::UnresolvedReference { type_name, attribute, referenced }) => {
            assert_eq!(type_name, "Project");
            assert_eq!(attribute, "owner");
            assert_eq!(referenced, "Nobody");
        }
        other => panic!("expected an unresolved reference, got {other:?}"),
    }
}

#[test]
fn redeclaring_an_inherited_field_fails() {
    let registry = setup();
    let defs = TypesDef::new(vec![], vec![], vec![], vec![HierarchicalTypeDefinition::new(
        "Intern",
        &["Person"],
        vec![AttributeDefinition::optional("name", "int")],
    )]);
    assert!(matches!(registry.define_types(&defs), Err(CatalogError::IncompatibleField { .. })));
}

#[test]
fn types_reference_each_other_within_a_batch() {
    let registry = TypeRegistry::new();
    let defs = TypesDef::new(vec![], vec![], vec![], vec![
        HierarchicalTypeDefinition::new("Employee", &[], vec![
            AttributeDefinition::optional("department", "Department").reverse("employees"),
        ]),
        HierarchicalTypeDefinition::new("Department", &[], vec![
            AttributeDefinition::collection("employees", "array<Employee>").reverse("department"),
        ]),
    ]);
    let defined = registry.define_types(&defs).expect("mutually referencing classes");
    assert_eq!(defined.iter().map(|t| t.name()).collect::<Vec<_>>(), vec!["Employee", "Department"]);
}

#[test]
fn self_inheritance_is_rejected() {
    let registry = TypeRegistry::new();
    let defs = TypesDef::new(vec![], vec![], vec![], vec![
        HierarchicalTypeDefinition::new("A", &["B"], vec![]),
        HierarchicalTypeDefinition::new("B", &["A"], vec![]),
    ]);
    assert!(matches!(registry.define_types(&defs), Err(CatalogError::InvalidTypeDefinition(_))));
    assert!(registry.type_names().expect("names").is_empty());
}

#[test]
fn primitive_names_are_reserved() {
    let registry = TypeRegistry::new();
    let defs = TypesDef::new(vec![], vec![StructTypeDefinition::new("string", vec![])], vec![], vec![]);
    assert!(matches!(registry.define_types(&defs), Err(CatalogError::InvalidTypeDefinition(_))));
}

#[test]
fn definitions_round_trip_through_json() {
    let registry = setup();
    let catalog = registry.snapshot().expect("snapshot");
    let defs = catalog.types_def("Manager").expect("definition");
    let parsed = TypesDef::from_json(&defs.to_json().expect("json")).expect("parse");
    assert_eq!(parsed, defs);
    assert_eq!(parsed.class_types[0].super_types, vec!["Person"]);
    // only the attributes the class itself declares
    assert_eq!(parsed.class_types[0].attribute_definitions.len(), 1);

    let other = TypeRegistry::new();
    other.define_types(&catalog.all_types_def()).expect("replay into a fresh registry");
    assert_eq!(other.type_names().expect("names"), registry.type_names().expect("names"));
}

#[test]
fn snapshots_do_not_see_later_batches() {
    let registry = setup();
    let before = registry.snapshot().expect("snapshot");
    let defs = TypesDef::new(vec![], vec![], vec![], vec![HierarchicalTypeDefinition::new("Team", &[], vec![])]);
    registry.define_types(&defs).expect("team");
    assert!(before.class("Team").is_none());
    assert!(registry.snapshot().expect("snapshot").class("Team").is_some());
}

#[test]
fn metadata_service_speaks_json() {
    let catalog = Catalog::in_memory().expect("catalog");
    let response = catalog
        .metadata()
        .create_type(
            r#"{"enumTypes": [{"name": "Tier", "enumValues": [{"value": "GOLD", "ordinal": 1}]}],
                "classTypes": [{"typeName": "Customer", "superTypes": [], "attributeDefinitions": [
                  {"name": "name", "dataTypeName": "string", "multiplicity": {"lower": 1, "upper": 1, "isUnique": false}},
                  {"name": "tier", "dataTypeName": "Tier", "multiplicity": {"lower": 0, "upper": 1, "isUnique": false}}]}]}"#,
        )
        .expect("create types");
    assert_eq!(response["Tier"], "Tier");
    assert_eq!(response["Customer"], "Customer");

    let definition = catalog.metadata().get_type_definition("Customer").expect("definition");
    let defs = TypesDef::from_json(&definition).expect("parse definition");
    assert_eq!(defs.class_types[0].attribute_definitions[1].data_type_name, "Tier");

    assert!(matches!(
        catalog.metadata().create_type("{}"),
        Err(CatalogError::InvalidTypeDefinition(_))
    ));
    assert!(matches!(catalog.metadata().create_type("not json"), Err(CatalogError::Serialization(_))));
    assert!(catalog.metadata().get_type_definition("Nope").unwrap_err().is_not_found());
}
