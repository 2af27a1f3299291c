//! Metacatalog – an extensible metadata catalog.
//!
//! Types are defined at runtime and kept in a registry; entities of those
//! types live as vertices in a property graph and can be searched with a
//! small query language, with raw traversals or as free text.
//!
//! ## Concepts
//! * A *type* is an enum, a struct, a trait or a class. Traits and classes
//!   form hierarchies; classes are the types entities are made of, traits are
//!   tags (possibly carrying attributes) attached to entities.
//! * An *entity* is an instance of a class identified by an [`identity::Id`].
//!   Attributes referencing other classes become graph edges; composite
//!   attributes own their targets, which are created and removed with them.
//! * A batch of type definitions ([`datatype::TypesDef`]) is all-or-nothing:
//!   a batch that fails validation leaves the [`registry::TypeRegistry`]
//!   untouched.
//!
//! ## Modules
//! * [`datatype`], [`registry`] – type definitions and the registry holding
//!   them.
//! * [`identity`], [`instance`], [`serialization`] – ids, untyped and typed
//!   values, and their JSON shape.
//! * [`graph`], [`persist`] – the property graph, in memory or in SQLite, and
//!   durable storage of type batches.
//! * [`repository`], [`indexer`], [`fulltext`], [`listener`] – entities on the
//!   graph and the listeners kept in step with them.
//! * [`dsl`], [`compiler`], [`traversal`] – the query language, its
//!   compilation into a traversal plan, and plan execution.
//! * [`gremlin`] – raw `g.V...` traversals straight against the graph.
//! * [`discovery`], [`lineage`], [`service`] – the services callers use.
//! * [`config`], [`catalog`] – settings and the wiring of a whole catalog.
//!
//! ## Quick Start
//! ```
//! use metacatalog::catalog::Catalog;
//! let catalog = Catalog::in_memory().unwrap();
//! catalog
//!     .metadata()
//!     .create_type(
//!         r#"{"classTypes": [{"typeName": "Department", "superTypes": [], "attributeDefinitions": [
//!             {"name": "name", "dataTypeName": "string",
//!              "multiplicity": {"lower": 1, "upper": 1, "isUnique": false}}]}]}"#,
//!     )
//!     .unwrap();
//! let guid = catalog
//!     .metadata()
//!     .create_entity(r#"{"typeName": "Department", "values": {"name": "hr"}}"#)
//!     .unwrap();
//! let result = catalog.discovery().search_by_dsl("Department where name = \"hr\"").unwrap();
//! assert_eq!(result.rows.len(), 1);
//! assert_eq!(result.rows[0]["$id$"]["id"], guid.as_str());
//! ```

pub mod catalog;
pub mod compiler;
pub mod config;
pub mod datatype;
pub mod discovery;
pub mod dsl;
pub mod error;
pub mod fulltext;
pub mod graph;
pub mod gremlin;
pub mod identity;
pub mod indexer;
pub mod instance;
pub mod lineage;
pub mod listener;
pub mod persist;
pub mod registry;
pub mod repository;
pub mod serialization;
pub mod service;
pub mod traversal;

pub use catalog::Catalog;
pub use config::CatalogConfig;
pub use error::{CatalogError, Result};
