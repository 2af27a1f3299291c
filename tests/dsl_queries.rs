use metacatalog::compiler::compile;
use metacatalog::datatype::{AttributeDefinition, HierarchicalTypeDefinition, TypesDef};
use metacatalog::dsl::{CompareOp, Expr, Literal, Step, parse_query};
use metacatalog::instance::{Referenceable, Struct, Value};
use metacatalog::{Catalog, CatalogError};
use serde_json::Value as Json;

// hr employs John and Jane; Jane manages John and holds a clearance
fn setup() -> Catalog {
    let catalog = Catalog::in_memory().expect("catalog");
    let defs = TypesDef::new(
        vec![],
        vec![],
        vec![HierarchicalTypeDefinition::new(
            "SecurityClearance",
            &[],
            vec![AttributeDefinition::optional("level", "int")],
        )],
        vec![
            HierarchicalTypeDefinition::new("Department", &[], vec![
                AttributeDefinition::required("name", "string"),
                AttributeDefinition::collection("employees", "array<Person>").composite().reverse("department"),
            ]),
            HierarchicalTypeDefinition::new("Person", &[], vec![
                AttributeDefinition::required("name", "string"),
                AttributeDefinition::optional("age", "int"),
                AttributeDefinition::optional("department", "Department").reverse("employees"),
                AttributeDefinition::optional("manager", "Manager").reverse("subordinates"),
            ]),
            HierarchicalTypeDefinition::new("Manager", &["Person"], vec![
                AttributeDefinition::collection("subordinates", "array<Person>").reverse("manager"),
            ]),
        ],
    );
    catalog.metadata().create_type(&defs.to_json().expect("json")).expect("fixture types");

    let hr = Referenceable::new("Department");
    let john = Referenceable::new("Person");
    let jane = Referenceable::new("Manager");
    let john = john
        .with("name", "John")
        .with("age", 28)
        .with("department", hr.id.clone())
        .with("manager", jane.id.clone());
    let jane = jane
        .with("name", "Jane")
        .with("age", 45)
        .with("department", hr.id.clone())
        .with("subordinates", vec![john.id.clone()])
        .with_trait(Struct::new("SecurityClearance").with("level", 1));
    let hr = hr.with("name", "hr").with("employees", vec![john, jane]);
    let typed = catalog.registry().snapshot().expect("snapshot").convert_instance(&hr).expect("convert");
    catalog.repository().create_entity(&typed).expect("create hr");
    catalog
}

fn rows(catalog: &Catalog, query: &str) -> Vec<Json> {
    catalog
        .discovery()
        .search_by_dsl(query)
        .unwrap_or_else(|e| panic!("query '{query}' failed: {e}"))
        .rows
}

fn names(rows: &[Json]) -> Vec<String> {
    let mut names: Vec<String> = rows.iter().filter_map(|r| r["name"].as_str().map(str::to_string)).collect();
    names.sort();
    names
}

#[test]
fn class_queries_include_subclasses() {
    let catalog = setup();
    assert_eq!(names(&rows(&catalog, "Department")), vec!["hr"]);
    assert_eq!(names(&rows(&catalog, "Person")), vec!["Jane", "John"]);
    assert_eq!(names(&rows(&catalog, "from Manager")), vec!["Jane"]);
    let department = &rows(&catalog, "Department")[0];
    assert_eq!(department["$typeName$"], "Department");
    assert_eq!(department["$id$"]["$typeName$"], "Department");
    assert_eq!(department["employees"].as_array().map(Vec::len), Some(2));
}

#[test]
fn filters_compare_and_combine() {
    let catalog = setup();
    assert_eq!(names(&rows(&catalog, r#"Person where name = "John""#)), vec!["John"]);
    assert_eq!(names(&rows(&catalog, r#"Person name == 'John'"#)), vec!["John"]);
    assert_eq!(names(&rows(&catalog, "Person where age > 30")), vec!["Jane"]);
    assert_eq!(names(&rows(&catalog, "Person where age + 5 >= 33")), vec!["Jane", "John"]);
    assert_eq!(names(&rows(&catalog, r#"Person where not name = "John""#)), vec!["Jane"]);
    assert_eq!(names(&rows(&catalog, r#"Person where name = "John" or age > 40"#)), vec!["Jane", "John"]);
    assert_eq!(names(&rows(&catalog, r#"Person where name != "John" and age < 40"#)), Vec::<String>::new());
    assert_eq!(names(&rows(&catalog, r#"Person where manager.name = "Jane""#)), vec!["John"]);
}

#[test]
fn traits_and_presence() {
    let catalog = setup();
    assert_eq!(names(&rows(&catalog, "Person is SecurityClearance")), vec!["Jane"]);
    assert_eq!(names(&rows(&catalog, "Person where Person isa SecurityClearance")), vec!["Jane"]);
    assert_eq!(names(&rows(&catalog, "Person where not Person is SecurityClearance")), vec!["John"]);
    assert_eq!(names(&rows(&catalog, "SecurityClearance")), vec!["Jane"]);
    assert_eq!(names(&rows(&catalog, "Person has manager")), vec!["John"]);
    assert_eq!(names(&rows(&catalog, "Person where has age")), vec!["Jane", "John"]);
}

#[test]
fn steps_follow_references_both_ways() {
    let catalog = setup();
    assert_eq!(names(&rows(&catalog, r#"Person where name = "John", department"#)), vec!["hr"]);
    assert_eq!(names(&rows(&catalog, "Department employees")), vec!["Jane", "John"]);
    assert_eq!(names(&rows(&catalog, r#"Department as d, Person where d.name = "hr""#)), vec!["Jane", "John"]);
    assert_eq!(names(&rows(&catalog, r#"Person where name = "John", Manager"#)), vec!["Jane"]);
    // entities reached twice are reported once
    assert_eq!(rows(&catalog, "Person department").len(), 1);
}

#[test]
fn select_projects_columns() {
    let catalog = setup();
    let result = catalog
        .discovery()
        .search_by_dsl(r#"Person where name = "John" select name, age as years, manager.name as boss, age * 2"#)
        .expect("select");
    assert_eq!(result.rows.len(), 1);
    let row = &result.rows[0];
    assert_eq!(row["name"], "John");
    assert_eq!(row["years"], 28);
    assert_eq!(row["boss"], "Jane");
    assert_eq!(row["_col_3"], 56);
    let result_type = result.data_type["typeName"].as_str().expect("type name");
    assert!(result_type.starts_with("__tempQueryResultStruct"));
    assert_eq!(row["$typeName$"], result_type);
    let columns: Vec<&str> = result.data_type["attributeDefinitions"]
        .as_array()
        .expect("columns")
        .iter()
        .filter_map(|c| c["dataTypeName"].as_str())
        .collect();
    assert_eq!(columns, vec!["string", "int", "string", "long"]);
}

#[test]
fn aliases_reach_back_along_the_traversal() {
    let catalog = setup();
    let rows = rows(&catalog, "Department as d, employees as e select d.name as department, e.name as employee");
    let mut pairs: Vec<(String, String)> = rows
        .iter()
        .map(|r| (r["department"].as_str().unwrap_or_default().to_string(), r["employee"].as_str().unwrap_or_default().to_string()))
        .collect();
    pairs.sort();
    assert_eq!(pairs, vec![("hr".to_string(), "Jane".to_string()), ("hr".to_string(), "John".to_string())]);
}

#[test]
fn loops_walk_until_nothing_new() {
    let catalog = setup();
    let result = rows(&catalog, r#"Person where name = "John" loop (manager)"#);
    assert_eq!(names(&result), vec!["Jane"]);
    let with_path = rows(&catalog, r#"Person where name = "John" loop (manager) withPath"#);
    let path: Vec<&str> = with_path[0]["path"]
        .as_array()
        .expect("path")
        .iter()
        .filter_map(|v| v["name"].as_str())
        .collect();
    assert_eq!(path, vec!["John", "Jane"]);
    assert_eq!(rows(&catalog, r#"Person where name = "Jane" loop (manager) times 3"#).len(), 0);
}

#[test]
fn limits_cap_rows() {
    let catalog = setup();
    assert_eq!(rows(&catalog, "Person limit 1").len(), 1);
    assert_eq!(rows(&catalog, "Person limit 10").len(), 2);
}

#[test]
fn queries_parse_into_steps() {
    let query = parse_query(r#"from Table as t where name = "x", columns select t.name limit 5"#).expect("parse");
    assert_eq!(query.steps.len(), 2);
    let Step::Source(first) = &query.steps[0] else { panic!("expected a source step") };
    assert_eq!(first.name, "Table");
    assert_eq!(first.alias.as_deref(), Some("t"));
    assert_eq!(
        first.filters,
        vec![Expr::Comparison {
            op: CompareOp::Eq,
            left: Box::new(Expr::Path(vec!["name".into()])),
            right: Box::new(Expr::Literal(Literal::String("x".into()))),
        }]
    );
    assert_eq!(query.select.len(), 1);
    assert_eq!(query.limit, Some(5));
    assert!(!query.with_path);
}

#[test]
fn every_keyword_parses_between_words() {
    let query = parse_query(
        "from Person as p where not age > 40 and has department or p is SecurityClearance, \
         loop ( manager ) 2 times as m select p.name as who, m.age withPath limit 3",
    )
    .expect("parse");
    assert_eq!(query.steps.len(), 2);
    let Step::Source(first) = &query.steps[0] else { panic!("expected a source step") };
    assert_eq!(first.alias.as_deref(), Some("p"));
    assert_eq!(first.filters.len(), 1);
    let Expr::Or(left, right) = &first.filters[0] else { panic!("expected an or, got {:?}", first.filters[0]) };
    assert!(matches!(**left, Expr::And(ref not, ref has) if matches!(**not, Expr::Not(_)) && matches!(**has, Expr::Has { .. })));
    assert!(matches!(**right, Expr::IsTrait { ref trait_name, .. } if trait_name == "SecurityClearance"));
    let Step::Loop(second) = &query.steps[1] else { panic!("expected a loop step") };
    assert_eq!(second.body.len(), 1);
    assert_eq!(second.times, Some(2));
    assert_eq!(second.alias.as_deref(), Some("m"));
    assert_eq!(query.select.len(), 2);
    assert_eq!(query.select[0].alias.as_deref(), Some("who"));
    assert!(query.with_path);
    assert_eq!(query.limit, Some(3));

    // words that merely start with a keyword are names
    let query = parse_query("Table where asset = 1 and origin = 2").expect("parse");
    let Step::Source(table) = &query.steps[0] else { panic!("expected a source step") };
    let Expr::And(asset, _) = &table.filters[0] else { panic!("expected an and") };
    assert!(matches!(**asset, Expr::Comparison { ref left, .. } if **left == Expr::Path(vec!["asset".into()])));
}

#[test]
fn plans_read_as_traversals() {
    let catalog = setup();
    let snapshot = catalog.registry().snapshot().expect("snapshot");
    let query = parse_query(r#"Person where name = "John", department"#).expect("parse");
    let plan = compile(&query, &snapshot).expect("compile");
    assert_eq!(plan.to_string(), "start(Person).as(Person).filter.Out(Person.department)");
}

#[test]
fn bad_queries_say_why() {
    let catalog = setup();
    let discovery = catalog.discovery();
    match discovery.search_by_dsl("from Bogus") {
        Err(CatalogError::Discovery { query, source }) => {
            assert_eq!(query, "from Bogus");
            assert!(matches!(*source, CatalogError::UnknownType(ref name) if name == "Bogus"));
        }
        other => panic!("expected a discovery error, got {other:?}"),
    }
    match discovery.search_by_dsl("Person where") {
        Err(CatalogError::QueryParse { line, col, .. }) => {
            assert_eq!(line, Some(1));
            assert!(col.is_some());
        }
        other => panic!("expected a parse error, got {other:?}"),
    }
    let unknown = discovery.search_by_dsl("Person where salary > 1").unwrap_err();
    assert!(matches!(unknown.root_cause(), CatalogError::UnknownAttribute { .. }));
    let not_a_trait = discovery.search_by_dsl("Person is Bogus").unwrap_err();
    assert!(matches!(not_a_trait.root_cause(), CatalogError::UnknownType(_)));
    let scalar_step = discovery.search_by_dsl("Person age").unwrap_err();
    assert!(matches!(scalar_step.root_cause(), CatalogError::InvalidQuery(_)));
    let zero = discovery.search_by_dsl("Person loop (manager) times 0").unwrap_err();
    assert!(matches!(zero.root_cause(), CatalogError::InvalidQuery(_)));
}

#[test]
fn new_entities_show_up_in_queries() {
    let catalog = setup();
    catalog
        .metadata()
        .create_entity(r#"{"typeName": "Department", "values": {"name": "it"}}"#)
        .expect("create");
    assert_eq!(names(&rows(&catalog, "Department")), vec!["hr", "it"]);
    let guid = catalog.repository().get_entity_list("Department").expect("list");
    assert_eq!(guid.len(), 2);
    let hr = rows(&catalog, r#"Department where name = "hr""#);
    let id = hr[0]["$id$"]["id"].as_str().expect("guid").to_string();
    catalog.repository().update_entity(&id, "name", &Value::from("people")).expect("rename");
    assert_eq!(names(&rows(&catalog, "Department")), vec!["it", "people"]);
}
