use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use metacatalog::compiler::compile;
use metacatalog::datatype::{AttributeDefinition, HierarchicalTypeDefinition, TypesDef};
use metacatalog::dsl::parse_query;
use metacatalog::identity::Id;
use metacatalog::instance::Referenceable;
use metacatalog::Catalog;

const FILTER: &str = r#"Table where name = "t_7" or rows > 990, columns select name"#;
const LINEAGE: &str = r#"Table where name = "t_0" loop (LoadProcess outputTables) times 5"#;

fn catalog() -> Catalog {
    let catalog = Catalog::in_memory().expect("catalog");
    let defs = TypesDef::new(vec![], vec![], vec![], vec![
        HierarchicalTypeDefinition::new("Column", &[], vec![AttributeDefinition::required("name", "string")]),
        HierarchicalTypeDefinition::new("Table", &[], vec![
            AttributeDefinition::required("name", "string"),
            AttributeDefinition::optional("rows", "long"),
            AttributeDefinition::collection("columns", "array<Column>").composite(),
        ]),
        HierarchicalTypeDefinition::new("LoadProcess", &[], vec![
            AttributeDefinition::required("name", "string"),
            AttributeDefinition::collection("inputTables", "array<Table>"),
            AttributeDefinition::collection("outputTables", "array<Table>"),
        ]),
    ]);
    catalog.metadata().create_type(&defs.to_json().expect("json")).expect("types");
    catalog
}

// appends tables `from..to`, each with three columns and a process from its predecessor
fn grow(catalog: &Catalog, from: usize, to: usize) {
    let snapshot = catalog.registry().snapshot().expect("snapshot");
    let repository = catalog.repository();
    let mut previous: Option<Id> = None;
    for n in from..to {
        let columns: Vec<Referenceable> = (0..3)
            .map(|c| Referenceable::new("Column").with("name", format!("c_{n}_{c}")))
            .collect();
        let table = Referenceable::new("Table")
            .with("name", format!("t_{n}"))
            .with("rows", n as i64)
            .with("columns", columns);
        let typed = snapshot.convert_instance(&table).expect("table");
        let id = repository.create_entity(&typed).expect("create table");
        if let Some(input) = previous.replace(id.clone()) {
            let process = Referenceable::new("LoadProcess")
                .with("name", format!("p_{n}"))
                .with("inputTables", vec![input])
                .with("outputTables", vec![id]);
            let typed = snapshot.convert_instance(&process).expect("process");
            repository.create_entity(&typed).expect("create process");
        }
    }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let catalog = catalog();
    let snapshot = catalog.registry().snapshot().expect("snapshot");
    c.bench_function("parse", |b| b.iter(|| parse_query(black_box(FILTER))));
    let query = parse_query(FILTER).expect("parse");
    c.bench_function("compile", |b| b.iter(|| compile(black_box(&query), &snapshot)));

    let discovery = catalog.discovery();
    for (from, to, label) in [(0, 10, "10"), (10, 100, "100"), (100, 1000, "1k")] {
        grow(&catalog, from, to);
        c.bench_function(&format!("filter {label}"), |b| b.iter(|| discovery.search_by_dsl(black_box(FILTER))));
        c.bench_function(&format!("lineage {label}"), |b| b.iter(|| discovery.search_by_dsl(black_box(LINEAGE))));
        c.bench_function(&format!("full text {label}"), |b| {
            b.iter(|| discovery.search_by_full_text(black_box("c_7_1")))
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
