use chrono::{Datelike, TimeZone, Utc};
use proptest::prelude::*;

use metacatalog::datatype::{
    AttributeDefinition, EnumTypeDefinition, EnumValue, HierarchicalTypeDefinition, PrimitiveKind,
    StructTypeDefinition, TypeCategory, TypesDef,
};
use metacatalog::identity::{Id, IdState};
use metacatalog::instance::{Instance, Referenceable, Struct, Value, convert_primitive};
use metacatalog::registry::TypeRegistry;
use metacatalog::serialization::{instance_to_json, json_to_value, referenceable_from_json, value_to_json};
use metacatalog::CatalogError;

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
        vec![HierarchicalTypeDefinition::new(
            "Sensitive",
            &[],
            vec![AttributeDefinition::optional("level", "Level")],
        )],
        vec![HierarchicalTypeDefinition::new("Other", &[], vec![]), HierarchicalTypeDefinition::new("Sample", &[], vec![
            AttributeDefinition::required("name", "string"),
            AttributeDefinition::optional("count", "int"),
            AttributeDefinition::optional("small", "byte"),
            AttributeDefinition::optional("level", "Level"),
            AttributeDefinition::optional("born", "date"),
            AttributeDefinition::optional("amount", "bigdecimal"),
            AttributeDefinition::optional("flag", "boolean"),
            AttributeDefinition::collection("scores", "array<int>"),
            AttributeDefinition::optional("limits", "map<string,long>"),
            AttributeDefinition::optional("address", "Address"),
            AttributeDefinition::optional("parent", "Sample"),
        ])],
    );
    registry.define_types(&defs).expect("fixture types");
    registry
}

fn sample() -> Referenceable {
    Referenceable::new("Sample")
        .with("name", "first")
        .with("count", "42")
        .with("level", "HIGH")
        .with("born", "2024-01-02")
        .with("amount", "12.50")
        .with("flag", "true")
        .with("scores", vec![Value::from("1"), Value::Long(2), Value::Double(3.0)])
        .with(
            "limits",
            Value::Map(vec![(Value::from("cpu"), Value::Int(4)), (Value::from("mem"), Value::from("16"))]),
        )
        .with("address", Struct::new("Address").with("street", "Main St").with("zip", 1234))
        .with_trait(Struct::new("Sensitive").with("level", 1))
}

#[test]
fn untyped_values_convert_to_their_attribute_types() {
    let registry = setup();
    let catalog = registry.snapshot().expect("snapshot");
    let typed = catalog.convert_instance(&sample()).expect("conversion");
    assert_eq!(typed.get("count").expect("count"), &Value::Int(42));
    assert_eq!(typed.get("flag").expect("flag"), &Value::Boolean(true));
    assert_eq!(typed.get("level").expect("level"), &Value::Enum(EnumValue::new("HIGH", 2)));
    assert_eq!(typed.get("scores").expect("scores"), &Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
    assert_eq!(
        typed.get("limits").expect("limits"),
        &Value::Map(vec![
            (Value::from("cpu"), Value::Long(4)),
            (Value::from("mem"), Value::Long(16)),
        ])
    );
    match typed.get("born").expect("born") {
        Value::Date(date) => assert_eq!((date.year(), date.month(), date.day()), (2024, 1, 2)),
        other => panic!("expected a date, got {other:?}"),
    }
    match typed.get("address").expect("address") {
        Value::TypedStruct(address) => assert_eq!(address.values().get("zip"), Some(&Value::Int(1234))),
        other => panic!("expected an address, got {other:?}"),
    }
    // enums also resolve by ordinal
    let low = typed.get_trait("Sensitive").expect("trait").values().get("level").cloned();
    assert_eq!(low, Some(Value::Enum(EnumValue::new("LOW", 1))));
    // unset optional attributes are present as null
    assert_eq!(typed.get("small").expect("small"), &Value::Null);
}

#[test]
fn bad_values_are_rejected() {
    let registry = setup();
    let catalog = registry.snapshot().expect("snapshot");

    let missing = Referenceable::new("Sample").with("count", 1);
    assert!(matches!(
        catalog.convert_instance(&missing),
        Err(CatalogError::NullRequiredAttribute { attribute }) if attribute == "name"
    ));

    let overflow = Referenceable::new("Sample").with("name", "x").with("small", 300);
    assert!(matches!(catalog.convert_instance(&overflow), Err(CatalogError::ValueConversion { .. })));

    let not_a_number = Referenceable::new("Sample").with("name", "x").with("count", "many");
    assert!(matches!(catalog.convert_instance(&not_a_number), Err(CatalogError::ValueConversion { .. })));

    let unknown_enum = Referenceable::new("Sample").with("name", "x").with("level", "MEDIUM");
    assert!(matches!(catalog.convert_instance(&unknown_enum), Err(CatalogError::ValueConversion { .. })));

    let not_a_class = Referenceable::new("Address");
    assert!(catalog.convert_instance(&not_a_class).unwrap_err().is_not_found());

    let unknown_trait = Referenceable::new("Sample").with("name", "x").with_trait_name("Nope");
    assert!(catalog.convert_instance(&unknown_trait).unwrap_err().is_not_found());
}

#[test]
fn typed_values_only_accept_typed_input() {
    let registry = setup();
    let catalog = registry.snapshot().expect("snapshot");
    let mut typed = catalog.convert_instance(&Referenceable::new("Sample").with("name", "x")).expect("conversion");
    typed.set("count", Value::from("7")).expect("primitive set converts");
    assert_eq!(typed.get("count").expect("count"), &Value::Int(7));
    assert!(typed.set("address", Struct::new("Address").with("street", "x").into()).is_err());
    assert!(matches!(typed.set("name", Value::Null), Err(CatalogError::NullRequiredAttribute { .. })));
    assert!(matches!(typed.get("nope"), Err(CatalogError::UnknownProperty { .. })));

    // collections of primitives are converted element by element
    typed.set("scores", vec![Value::from("3"), Value::Long(4)].into()).expect("scores");
    assert_eq!(typed.get("scores").expect("scores"), &Value::Array(vec![Value::Int(3), Value::Int(4)]));
    let conversion = |result: Result<(), CatalogError>| matches!(result, Err(CatalogError::ValueConversion { .. }));
    assert!(conversion(typed.set("scores", vec![Value::from("many")].into())));
    assert!(conversion(typed.set("limits", Value::Map(vec![(Value::from("cpu"), Value::from("lots"))]))));

    assert!(conversion(typed.set("level", Value::from("BOGUS"))));
    assert!(conversion(typed.set("address", Value::Long(5))));
    assert!(conversion(typed.set_converted("level", &Value::from("BOGUS"), &catalog)));
    assert!(conversion(typed.set_converted("address", &Value::Long(5), &catalog)));

    // already typed values still need the catalog
    let sensitive = catalog
        .convert_struct(TypeCategory::Trait, "Sensitive", &Struct::new("Sensitive").into())
        .map(Value::TypedStruct)
        .expect("trait");
    assert!(conversion(typed.set("address", sensitive.clone())));
    assert!(conversion(typed.set("level", Value::Enum(EnumValue::new("MEDIUM", 7)))));
    assert!(conversion(typed.set("parent", Id::new("abc", 0, "Other").into())));

    // through the catalog the same checks apply to typed input
    assert!(conversion(typed.set_converted("address", &sensitive, &catalog)));
    assert!(conversion(typed.set_converted("level", &Value::Enum(EnumValue::new("MEDIUM", 7)), &catalog)));
    assert!(conversion(typed.set_converted("level", &Value::Enum(EnumValue::new("HIGH", 1)), &catalog)));
    assert!(conversion(typed.set_converted("parent", &Id::new("abc", 0, "Other").into(), &catalog)));
    assert!(conversion(typed.set_converted("scores", &vec![Value::Enum(EnumValue::new("LOW", 1))].into(), &catalog)));
    typed.set_converted("level", &Value::Enum(EnumValue::new("LOW", 1)), &catalog).expect("member");
    typed.set_converted("parent", &Id::new("abc", 0, "Sample").into(), &catalog).expect("reference");
    let address = Struct::new("Address").with("street", "Main St");
    typed.set_converted("address", &address.into(), &catalog).expect("address");
    assert!(matches!(typed.get("address").expect("address"), Value::TypedStruct(a) if a.type_name() == "Address"));
}

#[test]
fn instances_survive_the_json_round_trip() {
    let registry = setup();
    let catalog = registry.snapshot().expect("snapshot");
    let typed = catalog.convert_instance(&sample()).expect("conversion");
    let json = instance_to_json(&typed);
    assert_eq!(json["typeName"], "Sample");
    assert_eq!(json["values"]["amount"], "12.50");
    assert_eq!(json["traits"]["Sensitive"]["typeName"], "Sensitive");

    let raw = referenceable_from_json(&json.to_string()).expect("parse");
    assert_eq!(raw.id, typed.id);
    let again = catalog.convert_instance(&raw).expect("convert again");
    assert_eq!(again, typed);
}

#[test]
fn json_shapes_map_to_values() {
    let id = json_to_value(&serde_json::json!({"id": "abc", "typeName": "Sample", "version": 2})).expect("id");
    assert_eq!(id, Value::Id(Id::new("abc", 2, "Sample")));
    let level = json_to_value(&serde_json::json!({"value": "LOW", "ordinal": 1})).expect("enum");
    assert_eq!(level, Value::Enum(EnumValue::new("LOW", 1)));
    let structure = json_to_value(&serde_json::json!({"typeName": "Address", "values": {"street": "x"}})).expect("struct");
    assert!(matches!(structure, Value::Struct(s) if s.type_name == "Address"));
    let huge = json_to_value(&serde_json::json!(u64::MAX)).expect("huge");
    assert_eq!(huge, Value::BigInteger("18446744073709551615".parse().expect("decimal")));
    assert!(convert_primitive(PrimitiveKind::Long, &huge).is_err());
    assert_eq!(convert_primitive(PrimitiveKind::BigInteger, &huge).expect("big"), huge);
    assert_eq!(json_to_value(&serde_json::json!(-3)).expect("long"), Value::Long(-3));
    assert_eq!(json_to_value(&serde_json::json!(2.5)).expect("double"), Value::Double(2.5));
    let map = json_to_value(&serde_json::json!({"a": 1})).expect("map");
    assert_eq!(map, Value::Map(vec![(Value::from("a"), Value::Long(1))]));
    assert!(referenceable_from_json("[1, 2]").is_err());

    let date = Value::Date(Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).single().expect("date"));
    assert_eq!(value_to_json(&date), serde_json::json!("2024-05-06T07:08:09.000Z"));
}

#[test]
fn primitive_conversion_edges() {
    assert_eq!(convert_primitive(PrimitiveKind::Long, &Value::Double(5.0)).expect("whole"), Value::Long(5));
    assert!(convert_primitive(PrimitiveKind::Long, &Value::Double(5.5)).is_err());
    assert_eq!(convert_primitive(PrimitiveKind::String, &Value::Int(3)).expect("text"), Value::from("3"));
    assert_eq!(convert_primitive(PrimitiveKind::Boolean, &Value::from(" FALSE ")).expect("bool"), Value::Boolean(false));
    assert!(convert_primitive(PrimitiveKind::Boolean, &Value::Int(1)).is_err());
    assert!(convert_primitive(PrimitiveKind::BigInteger, &Value::from("1.5")).is_err());
    let from_millis = convert_primitive(PrimitiveKind::Date, &Value::Long(0)).expect("epoch");
    assert_eq!(from_millis, Value::Date(Utc.timestamp_millis_opt(0).single().expect("epoch")));
}

#[test]
fn ids_start_unassigned() {
    let first = Id::unassigned("Sample");
    let second = Id::unassigned("Sample");
    assert_ne!(first, second);
    assert!(first.is_unassigned() && !first.is_assigned());
    assert_eq!(first.state(), IdState::Unassigned);
    let assigned = Id::assign("Sample");
    assert!(assigned.is_assigned());
    assert_eq!(assigned.state(), IdState::Assigned);
    let typed_by_hand = Id::new("abc", 0, "Sample");
    assert!(!typed_by_hand.is_assigned() && !typed_by_hand.is_unassigned());
    assert_eq!(typed_by_hand.state(), IdState::Invalid);
    let json = serde_json::to_value(&typed_by_hand).expect("serialize");
    assert_eq!(json["state"], "INVALID");
    assert!(Referenceable::new("Sample").get("id").expect("missing is null").is_null());
    assert!(first.clone().get("anything").is_err());
}

proptest! {
    #[test]
    fn id_equality_is_structural(id in "[a-z0-9-]{1,20}", version in 0i32..100, type_name in "[A-Z][a-z]{0,10}") {
        let a = Id::new(id.clone(), version, type_name.clone());
        let b = Id::new(id.clone(), version, type_name.clone());
        prop_assert_eq!(&a, &b);
        prop_assert_ne!(&a, &Id::new(id, version + 1, type_name));
    }

    #[test]
    fn ids_round_trip_through_json(id in "[a-z0-9-]{1,20}", version in 0i32..100, type_name in "[A-Z][a-z]{0,10}") {
        let original = Id::new(id, version, type_name);
        let json = serde_json::to_string(&original).expect("serialize");
        let parsed: Id = serde_json::from_str(&json).expect("deserialize");
        prop_assert_eq!(parsed, original);
    }

    #[test]
    fn state_agrees_with_the_predicates(id in "-?[0-9a-f-]{0,36}") {
        let id = Id::new(id, 0, "Sample");
        let expected = match (id.is_assigned(), id.is_unassigned()) {
            (true, false) => IdState::Assigned,
            (false, true) => IdState::Unassigned,
            (false, false) => IdState::Invalid,
            (true, true) => panic!("{id:?} is both assigned and unassigned"),
        };
        prop_assert_eq!(id.state(), expected);
    }

    #[test]
    fn issued_ids_report_their_state(placeholders in 1usize..10) {
        for _ in 0..placeholders {
            prop_assert_eq!(Id::unassigned("Sample").state(), IdState::Unassigned);
            prop_assert_eq!(Id::assign("Sample").state(), IdState::Assigned);
        }
    }

    #[test]
    fn placeholders_never_repeat(count in 1usize..50) {
        let ids: std::collections::HashSet<Id> = (0..count).map(|_| Id::unassigned("Sample")).collect();
        prop_assert_eq!(ids.len(), count);
        prop_assert!(ids.iter().all(Id::is_unassigned));
    }
}
