//! Property indexes for the graph store.
//!
//! The indexer listens for new types and indexes the property key of every
//! scalar attribute a class or trait declares, next to the system keys used
//! to find vertices by guid, type and trait.

use std::sync::Arc;

use tracing::debug;

use crate::datatype::{DataType, TypeCategory};
use crate::error::Result;
use crate::graph::{GUID_KEY, GraphStore, SUPER_TYPES_KEY, TRAIT_NAMES_KEY, TYPE_NAME_KEY};
use crate::listener::TypesChangeListener;

/// Keeps graph property indexes in step with the registered types: every
/// scalar attribute of a new class or trait gets an index on its property key.
pub struct GraphIndexer {
    graph: Arc<dyn GraphStore>,
}

impl GraphIndexer {
    pub const SYSTEM_KEYS: [&'static str; 4] = [GUID_KEY, TYPE_NAME_KEY, SUPER_TYPES_KEY, TRAIT_NAMES_KEY];

    /// Creates the indexer and the indexes on the system properties.
    pub fn new(graph: Arc<dyn GraphStore>) -> Result<Self> {
        for key in Self::SYSTEM_KEYS {
            graph.create_index(key)?;
        }
        Ok(Self { graph })
    }
}

impl TypesChangeListener for GraphIndexer {
    fn on_add(&self, type_name: &str, data_type: &DataType) -> Result<()> {
        if !matches!(data_type.category(), TypeCategory::Class | TypeCategory::Trait) {
            return Ok(());
        }
        let Some(fields) = data_type.field_mapping() else {
            return Ok(());
        };
        // inherited attributes were indexed with their declaring type
        for attribute in fields.iter().filter(|a| a.declaring_type == type_name && !a.data_type.is_edge()) {
            self.graph.create_index(&attribute.property_key())?;
        }
        debug!("Indexed attributes of {}", type_name);
        Ok(())
    }
}
