//! Wires a catalog together from its configuration: storage, registry,
//! indexes, listeners and the services on top.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Backend, CatalogConfig};
use crate::discovery::DiscoveryService;
use crate::error::Result;
use crate::fulltext::{FullTextIndex, MemoryFullTextIndex};
use crate::graph::{GraphStore, MemoryGraph};
use crate::indexer::GraphIndexer;
use crate::lineage::LineageService;
use crate::listener::{EntityChangeListener, EntityListeners, TypesChangeListener, TypesListeners};
use crate::persist::{
    MemoryTypeStore, SharedConnection, SqliteGraph, SqliteTypeStore, TypeStore, in_memory_connection,
    open_connection,
};
use crate::registry::TypeRegistry;
use crate::repository::GraphRepository;
use crate::service::MetadataService;

pub struct Catalog {
    config: CatalogConfig,
    registry: Arc<TypeRegistry>,
    repository: Arc<GraphRepository>,
    discovery: Arc<DiscoveryService>,
    lineage: LineageService,
    metadata: MetadataService,
}

impl Catalog {
    /// Opens a catalog. With the sqlite backend, types stored by an earlier
    /// run are defined again and the text index is rebuilt from the graph.
    pub fn open(config: CatalogConfig) -> Result<Self> {
        config.validate()?;
        let (graph, type_store): (Arc<dyn GraphStore>, Arc<dyn TypeStore>) = match config.storage.backend {
            Backend::Memory => (Arc::new(MemoryGraph::new()), Arc::new(MemoryTypeStore::new())),
            Backend::Sqlite => {
                let connection: SharedConnection = match &config.storage.path {
                    Some(path) => open_connection(path)?,
                    None => in_memory_connection()?,
                };
                (
                    Arc::new(SqliteGraph::new(Arc::clone(&connection))),
                    Arc::new(SqliteTypeStore::new(connection)),
                )
            }
        };

        let registry = Arc::new(TypeRegistry::new());
        let types_listeners = Arc::new(TypesListeners::new());
        let indexer: Arc<dyn TypesChangeListener> = Arc::new(GraphIndexer::new(Arc::clone(&graph))?);
        types_listeners.register(indexer)?;

        let entity_listeners = Arc::new(EntityListeners::new());
        let full_text = if config.search.full_text {
            let index = Arc::new(MemoryFullTextIndex::new());
            let listener: Arc<dyn EntityChangeListener> = Arc::clone(&index) as Arc<dyn EntityChangeListener>;
            entity_listeners.register(listener)?;
            Some(index)
        } else {
            None
        };

        let repository = Arc::new(GraphRepository::new(Arc::clone(&registry), graph, entity_listeners));

        let restored = type_store.restore()?;
        if !restored.is_empty() {
            for data_type in registry.define_types(&restored)? {
                types_listeners.notify("type restored", |l| l.on_add(&data_type.name(), &data_type));
            }
            info!("Restored {} stored types", registry.type_names()?.len());
        }
        if let Some(index) = &full_text {
            rebuild_text_index(&registry, &repository, index)?;
        }

        let discovery = Arc::new(DiscoveryService::new(
            Arc::clone(&repository),
            full_text.map(|index| index as Arc<dyn FullTextIndex>),
            config.query.clone(),
        ));
        let lineage = LineageService::new(Arc::clone(&registry), Arc::clone(&discovery), config.lineage.clone());
        let metadata =
            MetadataService::new(Arc::clone(&registry), type_store, Arc::clone(&repository), types_listeners);
        info!("Catalog opened with {:?} storage", config.storage.backend);
        Ok(Self { config, registry, repository, discovery, lineage, metadata })
    }

    /// An in-memory catalog with default settings.
    pub fn in_memory() -> Result<Self> {
        Self::open(CatalogConfig::default())
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }
    pub fn repository(&self) -> &Arc<GraphRepository> {
        &self.repository
    }
    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }
    pub fn lineage(&self) -> &LineageService {
        &self.lineage
    }
    pub fn metadata(&self) -> &MetadataService {
        &self.metadata
    }
}

// Entities already in the graph are fed to the index as if just created.
fn rebuild_text_index(
    registry: &TypeRegistry,
    repository: &GraphRepository,
    index: &MemoryFullTextIndex,
) -> Result<()> {
    let mut instances = Vec::new();
    for class in registry.class_names()? {
        for guid in repository.get_entity_list(&class)? {
            match repository.get_entity_definition(&guid) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!("Entity {} left out of the text index: {}", guid, e),
            }
        }
    }
    if !instances.is_empty() {
        index.on_entity_added(&instances)?;
        info!("Text index rebuilt from {} entities", instances.len());
    }
    Ok(())
}
