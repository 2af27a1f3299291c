//! JSON-in, JSON-out façade over the registry and the repository.

use std::sync::Arc;

use serde_json::{Map, Value as Json};
use tracing::{error, info};

use crate::datatype::{TypeCategory, TypesDef};
use crate::error::{CatalogError, Result};
use crate::instance::Value;
use crate::listener::{EntityChangeListener, TypesChangeListener, TypesListeners};
use crate::persist::TypeStore;
use crate::registry::TypeRegistry;
use crate::repository::GraphRepository;
use crate::serialization::{instance_to_json, json_to_value, referenceable_from_json, struct_from_json};

pub struct MetadataService {
    registry: Arc<TypeRegistry>,
    type_store: Arc<dyn TypeStore>,
    repository: Arc<GraphRepository>,
    types_listeners: Arc<TypesListeners>,
}

impl MetadataService {
    pub fn new(
        registry: Arc<TypeRegistry>,
        type_store: Arc<dyn TypeStore>,
        repository: Arc<GraphRepository>,
        types_listeners: Arc<TypesListeners>,
    ) -> Self {
        Self { registry, type_store, repository, types_listeners }
    }

    // ------------- Types -------------
    /// Defines a batch of types from TypesDef JSON and answers with a map
    /// from each new type name to itself. The batch is written to the type
    /// store before it becomes visible.
    pub fn create_type(&self, json: &str) -> Result<Json> {
        let defs = TypesDef::from_json(json)?;
        if defs.is_empty() {
            return Err(CatalogError::InvalidTypeDefinition("the definition holds no types".to_string()));
        }
        let added = self.registry.define_types_committing(&defs, |batch| {
            self.type_store.store(batch).inspect_err(|e| error!("Could not store type batch: {}", e))
        })?;
        let mut response = Map::new();
        for data_type in &added {
            let name = data_type.name();
            self.types_listeners.notify("type added", |l| l.on_add(&name, data_type));
            response.insert(name.clone(), Json::String(name));
        }
        Ok(Json::Object(response))
    }

    pub fn get_type_definition(&self, type_name: &str) -> Result<String> {
        self.registry.snapshot()?.types_def(type_name)?.to_json()
    }

    pub fn get_type_names(&self) -> Result<Vec<String>> {
        self.registry.type_names()
    }

    pub fn get_trait_names(&self) -> Result<Vec<String>> {
        self.registry.trait_names()
    }

    // ------------- Entities -------------
    /// Creates an entity (and everything it owns) from instance JSON,
    /// returning its guid.
    pub fn create_entity(&self, json: &str) -> Result<String> {
        let raw = referenceable_from_json(json)?;
        let catalog = self.registry.snapshot()?;
        let typed = catalog.convert_instance(&raw)?;
        let id = self.repository.create_entity(&typed)?;
        Ok(id.id().to_string())
    }

    pub fn get_entity_definition(&self, guid: &str) -> Result<String> {
        let instance = self.repository.get_entity_definition(guid)?;
        Ok(serde_json::to_string(&instance_to_json(&instance))?)
    }

    /// Guids of the entities of a registered class.
    pub fn get_entity_list(&self, type_name: &str) -> Result<Vec<String>> {
        self.registry.snapshot()?.require_class(type_name)?;
        self.repository.get_entity_list(type_name)
    }

    /// Sets one attribute. `value` is read as JSON when it parses as JSON
    /// and taken as a plain string otherwise.
    pub fn update_entity(&self, guid: &str, property: &str, value: &str) -> Result<()> {
        let value = match serde_json::from_str::<Json>(value) {
            Ok(json) => json_to_value(&json)?,
            Err(_) => Value::String(value.to_string()),
        };
        self.repository.update_entity(guid, property, &value)
    }

    // ------------- Traits -------------
    pub fn get_trait_names_of(&self, guid: &str) -> Result<Vec<String>> {
        self.repository.get_trait_names(guid)
    }

    pub fn add_trait(&self, guid: &str, json: &str) -> Result<()> {
        let raw = struct_from_json(json)?;
        let typed = self.registry.snapshot()?.convert_trait(&raw)?;
        self.repository.add_trait(guid, &typed)?;
        info!("Trait '{}' added to {}", raw.type_name, guid);
        Ok(())
    }

    pub fn delete_trait(&self, guid: &str, trait_name: &str) -> Result<()> {
        self.registry.get_type(TypeCategory::Trait, trait_name)?;
        self.repository.delete_trait(guid, trait_name)
    }

    // ------------- Listeners -------------
    pub fn register_types_listener(&self, listener: Arc<dyn TypesChangeListener>) -> Result<()> {
        self.types_listeners.register(listener)
    }
    pub fn unregister_types_listener(&self, listener: &Arc<dyn TypesChangeListener>) -> Result<bool> {
        self.types_listeners.unregister(listener)
    }
    pub fn register_entity_listener(&self, listener: Arc<dyn EntityChangeListener>) -> Result<()> {
        self.repository.listeners().register(listener)
    }
    pub fn unregister_entity_listener(&self, listener: &Arc<dyn EntityChangeListener>) -> Result<bool> {
        self.repository.listeners().unregister(listener)
    }
}
