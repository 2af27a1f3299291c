//! Maps typed instances onto the property graph.
//!
//! An entity is one vertex carrying `guid`, `typeName`, `superTypeNames`,
//! `traitNames`, `version` and `timestamp`, plus one property per scalar
//! attribute keyed `<DeclaringType>.<attribute>`. Class references become
//! edges labelled the same way; struct values and traits become vertices of
//! their own, owned by the entity through composite edges. A trait vertex
//! hangs off an edge labelled `<EntityType>.<Trait>`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::datatype::{AttributeInfo, AttributeType, FieldMapping};
use crate::error::{CatalogError, Result};
use crate::graph::{
    COMPOSITE_KEY, Direction, Edge, GUID_KEY, GraphBatch, GraphStore, INDEX_KEY, MAP_KEY, Properties,
    PropertyValue, SUPER_TYPES_KEY, TIMESTAMP_KEY, TRAIT_NAMES_KEY, TYPE_NAME_KEY, VERSION_KEY, Vertex,
    VertexId, VertexRef,
};
use crate::identity::Id;
use crate::instance::{Instance, Referenceable, Struct, TypedInstance, TypedStruct, Value};
use crate::listener::EntityListeners;
use crate::registry::{TypeCatalog, TypeRegistry};

// ------------- Property values -------------
/// The stored form of a scalar value; `None` for null.
pub fn to_property(value: &Value) -> Option<PropertyValue> {
    match value {
        Value::Null => None,
        Value::Boolean(v) => Some(PropertyValue::Bool(*v)),
        Value::Byte(v) => Some(PropertyValue::Long(*v as i64)),
        Value::Short(v) => Some(PropertyValue::Long(*v as i64)),
        Value::Int(v) => Some(PropertyValue::Long(*v as i64)),
        Value::Long(v) => Some(PropertyValue::Long(*v)),
        Value::Float(v) => Some(PropertyValue::Double(*v as f64)),
        Value::Double(v) => Some(PropertyValue::Double(*v)),
        Value::BigInteger(v) | Value::BigDecimal(v) => Some(PropertyValue::String(v.to_string())),
        Value::Date(v) => Some(PropertyValue::Long(v.timestamp_millis())),
        Value::String(v) => Some(PropertyValue::String(v.clone())),
        Value::Enum(v) => Some(PropertyValue::String(v.value.clone())),
        Value::Array(values) => Some(PropertyValue::List(values.iter().filter_map(to_property).collect())),
        Value::Map(entries) => Some(PropertyValue::Map(
            entries
                .iter()
                .filter_map(|(k, v)| Some((k.to_string(), to_property(v)?)))
                .collect(),
        )),
        Value::Id(id) => Some(PropertyValue::String(id.id().to_string())),
        Value::Struct(_) | Value::Referenceable(_) | Value::TypedStruct(_) | Value::Instance(_) => None,
    }
}

/// The raw value of a stored property, before conversion to its declared type.
pub fn from_property(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Bool(v) => Value::Boolean(*v),
        PropertyValue::Long(v) => Value::Long(*v),
        PropertyValue::Double(v) => Value::Double(*v),
        PropertyValue::String(v) => Value::String(v.clone()),
        PropertyValue::List(items) => Value::Array(items.iter().map(from_property).collect()),
        PropertyValue::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), from_property(v)))
                .collect(),
        ),
    }
}

fn string_list(vertex: &Vertex, key: &str) -> Vec<String> {
    match vertex.property(key) {
        Some(PropertyValue::List(items)) => items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

fn to_repository_error(e: CatalogError) -> CatalogError {
    match e {
        CatalogError::Persistence(message) => CatalogError::Repository(message),
        other => other,
    }
}

/// Trait edges are labelled with the entity type and the trait name.
pub fn trait_label(entity_type: &str, trait_name: &str) -> String {
    format!("{}.{}", entity_type, trait_name)
}

// how far composite children are expanded when reading
#[derive(Clone, Copy, PartialEq, Eq)]
enum Depth {
    Nested,
    Shallow,
}

// ------------- Create planning -------------
#[derive(Default)]
struct CreatePlan {
    // incoming id (placeholder or guid) -> final id
    ids: HashMap<String, Id>,
    pending: Vec<TypedInstance>,
}

// ------------- Repository -------------
pub struct GraphRepository {
    registry: Arc<TypeRegistry>,
    graph: Arc<dyn GraphStore>,
    listeners: Arc<EntityListeners>,
}

impl GraphRepository {
    pub fn new(registry: Arc<TypeRegistry>, graph: Arc<dyn GraphStore>, listeners: Arc<EntityListeners>) -> Self {
        Self { registry, graph, listeners }
    }
    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }
    pub fn listeners(&self) -> &Arc<EntityListeners> {
        &self.listeners
    }

    pub fn find_vertex(&self, guid: &str) -> Result<Option<VertexId>> {
        Ok(self
            .graph
            .vertices_where(GUID_KEY, &PropertyValue::String(guid.to_string()))?
            .into_iter()
            .next())
    }

    fn entity_vertex(&self, guid: &str) -> Result<Vertex> {
        self.find_vertex(guid)?
            .map(|id| self.graph.vertex(id))
            .transpose()?
            .flatten()
            .ok_or_else(|| CatalogError::EntityNotFound(guid.to_string()))
    }

    /// The identity stored on an entity vertex.
    pub fn entity_id(vertex: &Vertex) -> Option<Id> {
        Some(Id::new(
            vertex.string(GUID_KEY)?,
            vertex.property(VERSION_KEY).and_then(PropertyValue::as_i64).unwrap_or(0) as i32,
            vertex.string(TYPE_NAME_KEY)?,
        ))
    }

    // ------------- Create -------------
    /// Persists an entity and everything it owns, returning its assigned id.
    pub fn create_entity(&self, instance: &TypedInstance) -> Result<Id> {
        self.create_entities(std::slice::from_ref(instance))?
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::Repository("nothing was created".to_string()))
    }

    /// Persists several entities in one atomic unit. References between them
    /// by unassigned id are resolved within the call.
    pub fn create_entities(&self, instances: &[TypedInstance]) -> Result<Vec<Id>> {
        let catalog = self.registry.snapshot()?;
        let mut plan = CreatePlan::default();
        let mut top = Vec::new();
        for instance in instances {
            top.push(self.collect(instance, true, &mut plan)?);
        }
        let ids = plan.ids;
        let relabel = move |id: &Id| ids.get(id.id()).cloned().unwrap_or_else(|| id.clone());
        let created: Vec<TypedInstance> = plan.pending.iter().map(|i| i.map_ids(&relabel)).collect();

        let mut batch = GraphBatch::new();
        let mut refs: HashMap<String, VertexRef> = HashMap::new();
        let mut unique_seen = HashSet::new();
        let now = Utc::now().timestamp_millis();
        for instance in &created {
            let class = catalog.require_class(instance.type_name())?;
            self.check_unique(instance.fields(), instance.values(), None, &mut unique_seen)?;
            let mut properties = Properties::new();
            properties.insert(GUID_KEY.to_string(), instance.id.id().into());
            properties.insert(TYPE_NAME_KEY.to_string(), instance.type_name().into());
            properties.insert(
                SUPER_TYPES_KEY.to_string(),
                PropertyValue::List(class.all_super_types.iter().map(|s| s.as_str().into()).collect()),
            );
            properties.insert(
                TRAIT_NAMES_KEY.to_string(),
                PropertyValue::List(instance.trait_names().into_iter().map(PropertyValue::String).collect()),
            );
            properties.insert(VERSION_KEY.to_string(), PropertyValue::Long(instance.id.version() as i64));
            properties.insert(TIMESTAMP_KEY.to_string(), PropertyValue::Long(now));
            scalar_properties(instance.fields(), instance.values(), &mut properties);
            let vertex = batch.add_vertex(properties);
            refs.insert(instance.id.id().to_string(), vertex);
        }
        for instance in &created {
            let vertex = *refs
                .get(instance.id.id())
                .ok_or_else(|| CatalogError::Repository(format!("no vertex planned for {}", instance.id)))?;
            self.write_edges(&mut batch, vertex, instance.fields(), instance.values(), &refs)?;
            for (trait_name, trait_struct) in instance.traits() {
                let trait_vertex = self.add_struct(&mut batch, trait_struct, &refs)?;
                batch.add_edge(
                    &trait_label(instance.type_name(), trait_name),
                    vertex,
                    trait_vertex,
                    composite_edge(true),
                );
            }
        }
        self.graph.apply(batch).map_err(to_repository_error)?;

        info!(
            "Created {} entities: {}",
            created.len(),
            created.iter().map(|i| i.id.to_string()).collect::<Vec<_>>().join(", ")
        );
        self.listeners.notify("entity added", |l| l.on_entity_added(&created));
        Ok(top)
    }

    // Pass one: decide which instances get created and with which ids.
    fn collect(&self, instance: &TypedInstance, top: bool, plan: &mut CreatePlan) -> Result<Id> {
        let key = instance.id.id().to_string();
        if let Some(id) = plan.ids.get(&key) {
            return Ok(id.clone());
        }
        let id = if instance.id.is_unassigned() {
            Id::assign(instance.type_name())
        } else if instance.id.is_assigned() {
            if self.find_vertex(&key)?.is_some() {
                if top {
                    return Err(CatalogError::Repository(format!("entity {} already exists", key)));
                }
                // an existing entity is only referenced
                return Ok(instance.id.clone());
            }
            Id::new(key.clone(), instance.id.version(), instance.type_name())
        } else {
            return Err(CatalogError::Identity(format!("'{}' is not a valid entity id", key)));
        };
        plan.ids.insert(key, id.clone());
        plan.pending.push(instance.clone());
        let mut nested = Vec::new();
        for value in instance.values().values() {
            nested_instances(value, &mut nested);
        }
        for trait_struct in instance.traits().values() {
            for value in trait_struct.values().values() {
                nested_instances(value, &mut nested);
            }
        }
        for child in nested {
            self.collect(&child, false, plan)?;
        }
        Ok(id)
    }

    fn check_unique(
        &self,
        fields: &FieldMapping,
        values: &indexmap::IndexMap<String, Value>,
        owner: Option<VertexId>,
        seen: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        for info in fields.iter().filter(|i| i.multiplicity.is_unique && !i.data_type.is_edge()) {
            let Some(value) = values.get(&info.name).and_then(to_property) else {
                continue;
            };
            let key = info.property_key();
            let clash = self.graph.vertices_where(&key, &value)?.into_iter().any(|v| Some(v) != owner);
            if clash || !seen.insert((key.clone(), value.to_string())) {
                return Err(CatalogError::UniqueConstraint {
                    type_name: info.declaring_type.clone(),
                    attribute: info.name.clone(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    fn target(&self, batch: &mut GraphBatch, value: &Value, refs: &HashMap<String, VertexRef>) -> Result<VertexRef> {
        match value {
            Value::TypedStruct(s) => self.add_struct(batch, s, refs),
            other => {
                let id = other
                    .as_id()
                    .ok_or_else(|| CatalogError::Repository(format!("cannot store {} as a reference", other.kind())))?;
                if let Some(vertex) = refs.get(id.id()) {
                    return Ok(*vertex);
                }
                self.find_vertex(id.id())?
                    .map(VertexRef::Existing)
                    .ok_or_else(|| CatalogError::EntityNotFound(id.to_string()))
            }
        }
    }

    fn write_edges(
        &self,
        batch: &mut GraphBatch,
        owner: VertexRef,
        fields: &FieldMapping,
        values: &indexmap::IndexMap<String, Value>,
        refs: &HashMap<String, VertexRef>,
    ) -> Result<()> {
        for info in fields.iter().filter(|i| i.data_type.is_edge()) {
            let label = info.property_key();
            let composite = info.is_composite || !info.data_type.is_class_reference();
            match values.get(&info.name) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => {
                    for (index, item) in items.iter().enumerate() {
                        let target = self.target(batch, item, refs)?;
                        let mut properties = composite_edge(composite);
                        properties.insert(INDEX_KEY.to_string(), PropertyValue::Long(index as i64));
                        batch.add_edge(&label, owner, target, properties);
                    }
                }
                Some(Value::Map(entries)) => {
                    for (key, item) in entries {
                        if item.is_null() {
                            continue;
                        }
                        let target = self.target(batch, item, refs)?;
                        let mut properties = composite_edge(composite);
                        properties.insert(MAP_KEY.to_string(), PropertyValue::String(key.to_string()));
                        batch.add_edge(&label, owner, target, properties);
                    }
                }
                Some(single) => {
                    let target = self.target(batch, single, refs)?;
                    batch.add_edge(&label, owner, target, composite_edge(composite));
                }
            }
        }
        Ok(())
    }

    fn add_struct(&self, batch: &mut GraphBatch, value: &TypedStruct, refs: &HashMap<String, VertexRef>) -> Result<VertexRef> {
        let mut properties = Properties::new();
        properties.insert(TYPE_NAME_KEY.to_string(), value.type_name().into());
        scalar_properties(value.fields(), value.values(), &mut properties);
        let vertex = batch.add_vertex(properties);
        self.write_edges(batch, vertex, value.fields(), value.values(), refs)?;
        Ok(vertex)
    }

    // ------------- Read -------------
    /// Rebuilds an entity, its traits and its composite children.
    pub fn get_entity_definition(&self, guid: &str) -> Result<TypedInstance> {
        let vertex = self.entity_vertex(guid)?;
        let catalog = self.registry.snapshot()?;
        let raw = self.read_referenceable(&vertex, &catalog, Depth::Nested, &mut HashSet::new())?;
        catalog.convert_instance(&raw)
    }

    /// Guids of every entity whose type is exactly `type_name`.
    pub fn get_entity_list(&self, type_name: &str) -> Result<Vec<String>> {
        let mut guids = Vec::new();
        for id in self.graph.vertices_where(TYPE_NAME_KEY, &PropertyValue::String(type_name.to_string()))? {
            if let Some(guid) = self.graph.vertex(id)?.as_ref().and_then(|v| v.string(GUID_KEY)) {
                guids.push(guid.to_string());
            }
        }
        Ok(guids)
    }

    pub fn get_trait_names(&self, guid: &str) -> Result<Vec<String>> {
        Ok(string_list(&self.entity_vertex(guid)?, TRAIT_NAMES_KEY))
    }

    fn read_referenceable(
        &self,
        vertex: &Vertex,
        catalog: &TypeCatalog,
        depth: Depth,
        visited: &mut HashSet<VertexId>,
    ) -> Result<Referenceable> {
        visited.insert(vertex.id);
        let id = Self::entity_id(vertex)
            .ok_or_else(|| CatalogError::Repository(format!("vertex {} is not an entity", vertex.id)))?;
        let class = catalog.require_class(id.type_name())?;
        let mut raw = Referenceable::with_id(id.clone());
        raw.values = self.read_values(vertex, &class.field_mapping, catalog, depth, visited)?;
        for trait_name in string_list(vertex, TRAIT_NAMES_KEY) {
            let Some(trait_type) = catalog.trait_type(&trait_name) else {
                continue;
            };
            let mut trait_struct = Struct::new(&trait_name);
            let label = trait_label(id.type_name(), &trait_name);
            if let Some(edge) = self.graph.edges(vertex.id, Direction::Out, Some(&label))?.first() {
                if let Some(trait_vertex) = self.graph.vertex(edge.in_vertex)? {
                    trait_struct.values =
                        self.read_values(&trait_vertex, &trait_type.field_mapping, catalog, depth, visited)?;
                }
            }
            raw.traits.insert(trait_name, trait_struct);
        }
        Ok(raw)
    }

    fn read_values(
        &self,
        vertex: &Vertex,
        fields: &FieldMapping,
        catalog: &TypeCatalog,
        depth: Depth,
        visited: &mut HashSet<VertexId>,
    ) -> Result<indexmap::IndexMap<String, Value>> {
        let mut values = indexmap::IndexMap::new();
        for info in fields.iter() {
            let value = if info.data_type.is_edge() {
                self.read_edges(vertex.id, info, catalog, depth, visited)?
            } else {
                vertex.property(&info.property_key()).map(from_property).unwrap_or(Value::Null)
            };
            values.insert(info.name.clone(), value);
        }
        Ok(values)
    }

    fn read_edges(
        &self,
        vertex: VertexId,
        info: &AttributeInfo,
        catalog: &TypeCatalog,
        depth: Depth,
        visited: &mut HashSet<VertexId>,
    ) -> Result<Value> {
        let edges = self.graph.edges(vertex, Direction::Out, Some(&info.property_key()))?;
        match &info.data_type {
            AttributeType::Array(_) => {
                let mut ordered: Vec<&Edge> = edges.iter().collect();
                ordered.sort_by_key(|e| e.properties.get(INDEX_KEY).and_then(PropertyValue::as_i64).unwrap_or(0));
                let mut items = Vec::new();
                for edge in ordered {
                    items.push(self.read_target(edge, catalog, depth, visited)?);
                }
                Ok(Value::Array(items))
            }
            AttributeType::Map(_, _) => {
                let mut entries = Vec::new();
                for edge in &edges {
                    let key = edge.properties.get(MAP_KEY).map(|k| k.to_string()).unwrap_or_default();
                    entries.push((Value::String(key), self.read_target(edge, catalog, depth, visited)?));
                }
                Ok(Value::Map(entries))
            }
            _ => match edges.first() {
                Some(edge) => self.read_target(edge, catalog, depth, visited),
                None => Ok(Value::Null),
            },
        }
    }

    fn read_target(&self, edge: &Edge, catalog: &TypeCatalog, depth: Depth, visited: &mut HashSet<VertexId>) -> Result<Value> {
        let Some(target) = self.graph.vertex(edge.in_vertex)? else {
            return Err(CatalogError::Repository(format!("edge {} points at a missing vertex", edge.id)));
        };
        if let Some(id) = Self::entity_id(&target) {
            if edge.is_composite() && depth == Depth::Nested && !visited.contains(&target.id) {
                return Ok(Value::Referenceable(self.read_referenceable(&target, catalog, depth, visited)?));
            }
            return Ok(Value::Id(id));
        }
        let type_name = target.string(TYPE_NAME_KEY).unwrap_or_default().to_string();
        let fields = catalog
            .struct_type(&type_name)
            .map(|s| Arc::clone(&s.field_mapping))
            .or_else(|| catalog.trait_type(&type_name).map(|t| Arc::clone(&t.field_mapping)))
            .ok_or_else(|| CatalogError::TypeNotFound { category: None, name: type_name.clone() })?;
        Ok(Value::Struct(Struct {
            values: self.read_values(&target, &fields, catalog, depth, visited)?,
            type_name,
        }))
    }

    /// The value of one attribute of a vertex, with references left as ids
    /// and scalars converted to their declared type.
    pub fn attribute_value(&self, vertex: &Vertex, info: &AttributeInfo, catalog: &TypeCatalog) -> Result<Value> {
        if info.data_type.is_edge() {
            return self.read_edges(vertex.id, info, catalog, Depth::Shallow, &mut HashSet::new());
        }
        let raw = vertex.property(&info.property_key()).map(from_property).unwrap_or(Value::Null);
        // stored values were valid when written; relax multiplicity for reads
        let relaxed = AttributeInfo { multiplicity: crate::datatype::Multiplicity::OPTIONAL, ..info.clone() };
        relaxed.convert(&raw, catalog).or(Ok(raw))
    }

    // ------------- Traits -------------
    pub fn add_trait(&self, guid: &str, trait_instance: &TypedStruct) -> Result<()> {
        let vertex = self.entity_vertex(guid)?;
        let entity_type = vertex.string(TYPE_NAME_KEY).unwrap_or_default().to_string();
        let trait_name = trait_instance.type_name().to_string();
        let mut names = string_list(&vertex, TRAIT_NAMES_KEY);
        if names.contains(&trait_name) {
            return Err(CatalogError::Repository(format!(
                "trait '{}' is already attached to entity {}",
                trait_name, guid
            )));
        }
        names.push(trait_name.clone());
        let mut batch = GraphBatch::new();
        let owner = VertexRef::Existing(vertex.id);
        let trait_vertex = self.add_struct(&mut batch, trait_instance, &HashMap::new())?;
        batch.add_edge(&trait_label(&entity_type, &trait_name), owner, trait_vertex, composite_edge(true));
        batch.set_property(owner, TRAIT_NAMES_KEY, PropertyValue::List(names.into_iter().map(PropertyValue::String).collect()));
        self.touch(&mut batch, &vertex);
        self.graph.apply(batch).map_err(to_repository_error)?;
        info!("Added trait '{}' to entity {}", trait_name, guid);
        self.listeners.notify("trait added", |l| l.on_trait_added(guid, trait_instance));
        Ok(())
    }

    pub fn delete_trait(&self, guid: &str, trait_name: &str) -> Result<()> {
        let vertex = self.entity_vertex(guid)?;
        let entity_type = vertex.string(TYPE_NAME_KEY).unwrap_or_default().to_string();
        let mut names = string_list(&vertex, TRAIT_NAMES_KEY);
        if !names.iter().any(|n| n == trait_name) {
            return Err(CatalogError::TraitNotFound { guid: guid.to_string(), trait_name: trait_name.to_string() });
        }
        names.retain(|n| n != trait_name);
        let mut batch = GraphBatch::new();
        let mut owned = Vec::new();
        for edge in self.graph.edges(vertex.id, Direction::Out, Some(&trait_label(&entity_type, trait_name)))? {
            self.owned_subtree(edge.in_vertex, &mut owned)?;
        }
        for owned_vertex in owned {
            batch.remove_vertex(owned_vertex);
        }
        let owner = VertexRef::Existing(vertex.id);
        batch.set_property(owner, TRAIT_NAMES_KEY, PropertyValue::List(names.into_iter().map(PropertyValue::String).collect()));
        self.touch(&mut batch, &vertex);
        self.graph.apply(batch).map_err(to_repository_error)?;
        info!("Deleted trait '{}' from entity {}", trait_name, guid);
        self.listeners.notify("trait deleted", |l| l.on_trait_deleted(guid, trait_name));
        Ok(())
    }

    // A vertex and every struct vertex it owns, children first so removal
    // order never trips over a vertex already gone.
    fn owned_subtree(&self, vertex: VertexId, owned: &mut Vec<VertexId>) -> Result<()> {
        if owned.contains(&vertex) {
            return Ok(());
        }
        for edge in self.graph.edges(vertex, Direction::Out, None)? {
            let is_struct = self
                .graph
                .vertex(edge.in_vertex)?
                .map(|v| v.property(GUID_KEY).is_none())
                .unwrap_or(false);
            if edge.is_composite() && is_struct {
                self.owned_subtree(edge.in_vertex, owned)?;
            }
        }
        owned.push(vertex);
        Ok(())
    }

    fn touch(&self, batch: &mut GraphBatch, vertex: &Vertex) {
        let version = vertex.property(VERSION_KEY).and_then(PropertyValue::as_i64).unwrap_or(0);
        let owner = VertexRef::Existing(vertex.id);
        batch.set_property(owner, VERSION_KEY, PropertyValue::Long(version + 1));
        batch.set_property(owner, TIMESTAMP_KEY, PropertyValue::Long(Utc::now().timestamp_millis()));
    }

    // ------------- Update -------------
    /// Replaces one scalar or reference attribute of an entity.
    pub fn update_entity(&self, guid: &str, property: &str, value: &Value) -> Result<()> {
        let vertex = self.entity_vertex(guid)?;
        let catalog = self.registry.snapshot()?;
        let type_name = vertex.string(TYPE_NAME_KEY).unwrap_or_default().to_string();
        let class = catalog.require_class(&type_name)?;
        let info = class.field_mapping.get(property).ok_or_else(|| CatalogError::UnknownProperty {
            type_name: type_name.clone(),
            property: property.to_string(),
        })?;
        let converted = info.convert(value, &catalog)?;
        let owner = VertexRef::Existing(vertex.id);
        let mut batch = GraphBatch::new();
        let key = info.property_key();
        if !info.data_type.is_edge() {
            let mut values = indexmap::IndexMap::new();
            values.insert(info.name.clone(), converted.clone());
            let single = single_field(info);
            self.check_unique(&single, &values, Some(vertex.id), &mut HashSet::new())?;
            match to_property(&converted) {
                Some(stored) => batch.set_property(owner, &key, stored),
                None => batch.remove_property(owner, &key),
            }
        } else if info.data_type.is_class_reference() && !info.is_composite {
            if matches!(&converted, Value::Instance(_))
                || matches!(&converted, Value::Array(items) if items.iter().any(|i| matches!(i, Value::Instance(_))))
            {
                return Err(CatalogError::Repository(format!(
                    "'{}' takes references to existing entities only",
                    key
                )));
            }
            for edge in self.graph.edges(vertex.id, Direction::Out, Some(&key))? {
                batch.remove_edge(edge.id);
            }
            let mut values = indexmap::IndexMap::new();
            values.insert(info.name.clone(), converted.clone());
            self.write_edges(&mut batch, owner, &single_field(info), &values, &HashMap::new())?;
        } else {
            return Err(CatalogError::Repository(format!(
                "'{}' is owned by the entity and cannot be updated in place",
                key
            )));
        }
        self.touch(&mut batch, &vertex);
        self.graph.apply(batch).map_err(to_repository_error)?;
        debug!("Updated {} of entity {} to {}", key, guid, converted);
        Ok(())
    }
}

fn single_field(info: &AttributeInfo) -> FieldMapping {
    let mut mapping = FieldMapping::new();
    // a fresh mapping cannot collide
    let _ = mapping.declare(&info.declaring_type, info.clone());
    mapping
}

fn composite_edge(composite: bool) -> Properties {
    let mut properties = Properties::new();
    properties.insert(COMPOSITE_KEY.to_string(), PropertyValue::Bool(composite));
    properties
}

fn scalar_properties(fields: &FieldMapping, values: &indexmap::IndexMap<String, Value>, properties: &mut Properties) {
    for info in fields.iter().filter(|i| !i.data_type.is_edge()) {
        if let Some(stored) = values.get(&info.name).and_then(to_property) {
            properties.insert(info.property_key(), stored);
        }
    }
}

fn nested_instances(value: &Value, nested: &mut Vec<TypedInstance>) {
    match value {
        Value::Instance(i) => nested.push((**i).clone()),
        Value::TypedStruct(s) => s.values().values().for_each(|v| nested_instances(v, nested)),
        Value::Array(items) => items.iter().for_each(|v| nested_instances(v, nested)),
        Value::Map(entries) => entries.iter().for_each(|(_, v)| nested_instances(v, nested)),
        _ => {}
    }
}
