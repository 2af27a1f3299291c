use std::io::Write;

use metacatalog::config::{Backend, CatalogConfig};
use metacatalog::{Catalog, CatalogError};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn files_override_the_defaults() {
    let file = write_config(
        r#"
        [storage]
        backend = "sqlite"

        [query]
        max_loop_depth = 4
        default_limit = 25

        [search]
        full_text = false

        [lineage]
        table_type = "Dataset"
        "#,
    );
    let config = CatalogConfig::load(Some(file.path())).expect("load");
    assert_eq!(config.storage.backend, Backend::Sqlite);
    assert_eq!(config.storage.path, None);
    assert_eq!(config.query.max_loop_depth, 4);
    assert_eq!(config.query.default_limit, Some(25));
    assert!(!config.search.full_text);
    assert_eq!(config.lineage.table_type, "Dataset");
    // sections and keys left out keep their defaults
    assert_eq!(config.lineage.process_type, "LoadProcess");
    assert_eq!(config.log.filter, "info");
}

#[test]
fn invalid_settings_are_refused() {
    let file = write_config("[query]\nmax_loop_depth = 0\n");
    assert!(matches!(CatalogConfig::load(Some(file.path())), Err(CatalogError::Config(_))));

    let mut config = CatalogConfig::default();
    config.query.max_loop_depth = 0;
    assert!(matches!(Catalog::open(config), Err(CatalogError::Config(_))));

    let unknown_backend = write_config("[storage]\nbackend = \"cassandra\"\n");
    assert!(matches!(CatalogConfig::load(Some(unknown_backend.path())), Err(CatalogError::Config(_))));

    let missing = std::env::temp_dir().join("no-such-metacatalog-config.toml");
    assert!(CatalogConfig::load(Some(missing.as_path())).is_err());
}

#[test]
fn query_settings_reach_the_catalog() {
    let mut config = CatalogConfig::default();
    config.query.default_limit = Some(1);
    let catalog = Catalog::open(config).expect("catalog");
    assert_eq!(catalog.config().query.default_limit, Some(1));
    let metadata = catalog.metadata();
    metadata
        .create_type(
            r#"{"classTypes": [{"typeName": "Tag", "superTypes": [], "attributeDefinitions": [
                {"name": "name", "dataTypeName": "string", "multiplicity": {"lower": 1, "upper": 1, "isUnique": false}}]}]}"#,
        )
        .expect("types");
    for name in ["a", "b", "c"] {
        metadata
            .create_entity(&format!(r#"{{"typeName": "Tag", "values": {{"name": "{name}"}}}}"#))
            .expect("tag");
    }
    let discovery = catalog.discovery();
    assert_eq!(discovery.search_by_dsl("Tag").expect("default limit").rows.len(), 1);
    // an explicit limit wins over the configured one
    assert_eq!(discovery.search_by_dsl("Tag limit 3").expect("explicit").rows.len(), 3);
}
