//! The property graph behind the repository.
//!
//! The catalog does not implement a graph database. It talks to one through
//! [`GraphStore`]: a handful of reads plus an atomic [`GraphBatch`] of
//! writes. [`MemoryGraph`] is the in-process implementation;
//! [`crate::persist::SqliteGraph`] keeps the same model in SQLite.

use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::sync::RwLock;

use roaring::RoaringTreemap;
use seahash::SeaHasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CatalogError, Result};

pub type OtherHasher = BuildHasherDefault<SeaHasher>;
pub type VertexId = u64;
pub type EdgeId = u64;

// ------------- Property keys -------------
pub const GUID_KEY: &str = "guid";
pub const TYPE_NAME_KEY: &str = "typeName";
pub const SUPER_TYPES_KEY: &str = "superTypeNames";
pub const TRAIT_NAMES_KEY: &str = "traitNames";
pub const VERSION_KEY: &str = "version";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const COMPOSITE_KEY: &str = "composite";
pub const INDEX_KEY: &str = "index";
pub const MAP_KEY: &str = "key";

// ------------- Values -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}
impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }
    /// True when this value is `other` or, for lists, contains it.
    pub fn matches(&self, other: &PropertyValue) -> bool {
        match self {
            Self::List(items) if !matches!(other, Self::List(_)) => items.contains(other),
            _ => self == other,
        }
    }
    /// Text used to key property indexes; list values index every element.
    pub fn index_terms(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.iter().map(|i| i.index_term()).collect(),
            other => vec![other.index_term()],
        }
    }
    fn index_term(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
            other => write!(f, "{}", serde_json::to_string(other).unwrap_or_default()),
        }
    }
}
impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}
impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}
impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub id: VertexId,
    pub properties: Properties,
}
impl Vertex {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
    pub fn string(&self, key: &str) -> Option<&str> {
        self.property(key).and_then(PropertyValue::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: EdgeId,
    pub label: String,
    pub out_vertex: VertexId,
    pub in_vertex: VertexId,
    pub properties: Properties,
}
impl Edge {
    pub fn is_composite(&self) -> bool {
        matches!(self.properties.get(COMPOSITE_KEY), Some(PropertyValue::Bool(true)))
    }
    /// The vertex at the other end, seen from `from`.
    pub fn other(&self, from: VertexId) -> VertexId {
        if self.out_vertex == from { self.in_vertex } else { self.out_vertex }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
    Both,
}
impl Direction {
    pub fn reverse(&self) -> Direction {
        match self {
            Self::Out => Self::In,
            Self::In => Self::Out,
            Self::Both => Self::Both,
        }
    }
}

// ------------- Batches -------------
/// A vertex named inside a batch: one created earlier in the same batch, or
/// one already in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexRef {
    New(usize),
    Existing(VertexId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    AddVertex(Properties),
    SetProperty { vertex: VertexRef, key: String, value: PropertyValue },
    RemoveProperty { vertex: VertexRef, key: String },
    AddEdge { label: String, out_vertex: VertexRef, in_vertex: VertexRef, properties: Properties },
    RemoveEdge(EdgeId),
    RemoveVertex(VertexId),
}

/// Writes applied all together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphBatch {
    ops: Vec<GraphOp>,
    new_vertices: usize,
}
impl GraphBatch {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn ops(&self) -> &[GraphOp] {
        &self.ops
    }
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
    pub fn add_vertex(&mut self, properties: Properties) -> VertexRef {
        self.ops.push(GraphOp::AddVertex(properties));
        self.new_vertices += 1;
        VertexRef::New(self.new_vertices - 1)
    }
    pub fn set_property(&mut self, vertex: VertexRef, key: &str, value: PropertyValue) {
        self.ops.push(GraphOp::SetProperty { vertex, key: key.to_string(), value });
    }
    pub fn remove_property(&mut self, vertex: VertexRef, key: &str) {
        self.ops.push(GraphOp::RemoveProperty { vertex, key: key.to_string() });
    }
    pub fn add_edge(&mut self, label: &str, out_vertex: VertexRef, in_vertex: VertexRef, properties: Properties) {
        self.ops.push(GraphOp::AddEdge { label: label.to_string(), out_vertex, in_vertex, properties });
    }
    pub fn remove_edge(&mut self, edge: EdgeId) {
        self.ops.push(GraphOp::RemoveEdge(edge));
    }
    /// Removes a vertex together with its edges.
    pub fn remove_vertex(&mut self, vertex: VertexId) {
        self.ops.push(GraphOp::RemoveVertex(vertex));
    }
}

// ------------- Store -------------
pub trait GraphStore: Send + Sync {
    /// Applies every write in the batch atomically, returning the ids of the
    /// vertices it created in creation order.
    fn apply(&self, batch: GraphBatch) -> Result<Vec<VertexId>>;
    fn vertex(&self, id: VertexId) -> Result<Option<Vertex>>;
    fn vertex_ids(&self) -> Result<Vec<VertexId>>;
    /// Vertices whose property `key` matches `value` (list properties match
    /// when they contain it).
    fn vertices_where(&self, key: &str, value: &PropertyValue) -> Result<Vec<VertexId>>;
    fn edges(&self, vertex: VertexId, direction: Direction, label: Option<&str>) -> Result<Vec<Edge>>;
    fn create_index(&self, key: &str) -> Result<()>;
    fn indexed_keys(&self) -> Result<Vec<String>>;

    fn vertex_count(&self) -> Result<usize> {
        Ok(self.vertex_ids()?.len())
    }
}

// ------------- Lookups -------------
#[derive(Debug)]
pub struct Lookup<K, V, H = RandomState> {
    index: HashMap<K, HashSet<V>, H>,
}
impl<K: Eq + Hash, V: Eq + Hash, H: BuildHasher + Default> Lookup<K, V, H> {
    pub fn new() -> Self {
        Self { index: HashMap::<K, HashSet<V>, H>::default() }
    }
    pub fn insert(&mut self, key: K, value: V) {
        self.index.entry(key).or_default().insert(value);
    }
    pub fn remove(&mut self, key: &K, value: &V) {
        if let Some(values) = self.index.get_mut(key) {
            values.remove(value);
            if values.is_empty() {
                self.index.remove(key);
            }
        }
    }
    pub fn lookup(&self, key: &K) -> Option<&HashSet<V>> {
        self.index.get(key)
    }
}
impl<K: Eq + Hash, V: Eq + Hash, H: BuildHasher + Default> Default for Lookup<K, V, H> {
    fn default() -> Self {
        Self::new()
    }
}

// ------------- Memory graph -------------
#[derive(Debug, Default)]
struct GraphState {
    next_vertex: VertexId,
    next_edge: EdgeId,
    vertices: BTreeMap<VertexId, Properties>,
    edges: BTreeMap<EdgeId, Edge>,
    out_edges: Lookup<VertexId, EdgeId, OtherHasher>,
    in_edges: Lookup<VertexId, EdgeId, OtherHasher>,
    // indexed key -> index term -> vertices
    indexes: HashMap<String, HashMap<String, RoaringTreemap, OtherHasher>, OtherHasher>,
}

impl GraphState {
    fn index_insert(&mut self, vertex: VertexId, key: &str, value: &PropertyValue) {
        if let Some(index) = self.indexes.get_mut(key) {
            for term in value.index_terms() {
                index.entry(term).or_default().insert(vertex);
            }
        }
    }
    fn index_remove(&mut self, vertex: VertexId, key: &str, value: &PropertyValue) {
        if let Some(index) = self.indexes.get_mut(key) {
            for term in value.index_terms() {
                if let Some(bitmap) = index.get_mut(&term) {
                    bitmap.remove(vertex);
                }
            }
        }
    }
    fn set_property(&mut self, vertex: VertexId, key: &str, value: PropertyValue) {
        let previous = self.vertices.get_mut(&vertex).and_then(|p| p.insert(key.to_string(), value.clone()));
        if let Some(previous) = previous {
            self.index_remove(vertex, key, &previous);
        }
        self.index_insert(vertex, key, &value);
    }
    fn remove_property(&mut self, vertex: VertexId, key: &str) {
        if let Some(previous) = self.vertices.get_mut(&vertex).and_then(|p| p.remove(key)) {
            self.index_remove(vertex, key, &previous);
        }
    }
    fn remove_edge(&mut self, edge: EdgeId) {
        if let Some(edge) = self.edges.remove(&edge) {
            self.out_edges.remove(&edge.out_vertex, &edge.id);
            self.in_edges.remove(&edge.in_vertex, &edge.id);
        }
    }
    fn incident_edges(&self, vertex: VertexId) -> BTreeSet<EdgeId> {
        let mut incident = BTreeSet::new();
        for lookup in [&self.out_edges, &self.in_edges] {
            if let Some(edges) = lookup.lookup(&vertex) {
                incident.extend(edges.iter().copied());
            }
        }
        incident
    }
    fn remove_vertex(&mut self, vertex: VertexId) {
        for edge in self.incident_edges(vertex) {
            self.remove_edge(edge);
        }
        if let Some(properties) = self.vertices.remove(&vertex) {
            for (key, value) in &properties {
                self.index_remove(vertex, key, value);
            }
        }
    }

    // Checks that every reference in the batch will resolve, so that the
    // application that follows cannot fail halfway.
    fn validate(&self, batch: &GraphBatch) -> Result<()> {
        let mut created = 0usize;
        let mut removed_vertices = HashSet::new();
        let mut removed_edges = HashSet::new();
        let check = |vertex: &VertexRef, created: usize, removed: &HashSet<VertexId>| -> Result<()> {
            match vertex {
                VertexRef::New(i) if *i < created => Ok(()),
                VertexRef::Existing(id) if self.vertices.contains_key(id) && !removed.contains(id) => Ok(()),
                other => Err(CatalogError::Repository(format!("batch refers to unknown vertex {:?}", other))),
            }
        };
        for op in batch.ops() {
            match op {
                GraphOp::AddVertex(_) => created += 1,
                GraphOp::SetProperty { vertex, .. } | GraphOp::RemoveProperty { vertex, .. } => {
                    check(vertex, created, &removed_vertices)?
                }
                GraphOp::AddEdge { out_vertex, in_vertex, .. } => {
                    check(out_vertex, created, &removed_vertices)?;
                    check(in_vertex, created, &removed_vertices)?;
                }
                GraphOp::RemoveEdge(edge) => {
                    if !self.edges.contains_key(edge) || !removed_edges.insert(*edge) {
                        return Err(CatalogError::Repository(format!("batch removes unknown edge {}", edge)));
                    }
                }
                GraphOp::RemoveVertex(vertex) => {
                    check(&VertexRef::Existing(*vertex), created, &removed_vertices)?;
                    removed_vertices.insert(*vertex);
                    // edges of a removed vertex go with it
                    removed_edges.extend(self.incident_edges(*vertex));
                }
            }
        }
        Ok(())
    }
}

/// A graph held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: RwLock<GraphState>,
}
impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphStore for MemoryGraph {
    fn apply(&self, batch: GraphBatch) -> Result<Vec<VertexId>> {
        let mut state = self.state.write()?;
        state.validate(&batch)?;
        let mut created = Vec::new();
        let resolve = |vertex: VertexRef, created: &Vec<VertexId>| match vertex {
            VertexRef::New(i) => created[i],
            VertexRef::Existing(id) => id,
        };
        for op in batch.ops {
            match op {
                GraphOp::AddVertex(properties) => {
                    let id = state.next_vertex;
                    state.next_vertex += 1;
                    state.vertices.insert(id, Properties::new());
                    for (key, value) in properties {
                        state.set_property(id, &key, value);
                    }
                    created.push(id);
                }
                GraphOp::SetProperty { vertex, key, value } => {
                    state.set_property(resolve(vertex, &created), &key, value)
                }
                GraphOp::RemoveProperty { vertex, key } => state.remove_property(resolve(vertex, &created), &key),
                GraphOp::AddEdge { label, out_vertex, in_vertex, properties } => {
                    let id = state.next_edge;
                    state.next_edge += 1;
                    let edge = Edge {
                        id,
                        label,
                        out_vertex: resolve(out_vertex, &created),
                        in_vertex: resolve(in_vertex, &created),
                        properties,
                    };
                    state.out_edges.insert(edge.out_vertex, id);
                    state.in_edges.insert(edge.in_vertex, id);
                    state.edges.insert(id, edge);
                }
                GraphOp::RemoveEdge(edge) => state.remove_edge(edge),
                GraphOp::RemoveVertex(vertex) => state.remove_vertex(vertex),
            }
        }
        Ok(created)
    }

    fn vertex(&self, id: VertexId) -> Result<Option<Vertex>> {
        let state = self.state.read()?;
        Ok(state.vertices.get(&id).map(|properties| Vertex { id, properties: properties.clone() }))
    }

    fn vertex_ids(&self) -> Result<Vec<VertexId>> {
        Ok(self.state.read()?.vertices.keys().copied().collect())
    }

    fn vertices_where(&self, key: &str, value: &PropertyValue) -> Result<Vec<VertexId>> {
        let state = self.state.read()?;
        if let Some(index) = state.indexes.get(key) {
            // index terms of a list value hold each element, so a list is
            // looked up by its first element and then checked in full
            let first = match value {
                PropertyValue::List(items) => items.first(),
                other => Some(other),
            };
            let Some(term) = first.and_then(|p| p.index_terms().into_iter().next()) else {
                return Ok(Vec::new());
            };
            return Ok(index
                .get(&term)
                .map(|bitmap| {
                    bitmap
                        .iter()
                        .filter(|id| {
                            state
                                .vertices
                                .get(id)
                                .and_then(|p| p.get(key))
                                .map(|v| v.matches(value))
                                .unwrap_or(false)
                        })
                        .collect()
                })
                .unwrap_or_default());
        }
        Ok(state
            .vertices
            .iter()
            .filter(|(_, properties)| properties.get(key).map(|v| v.matches(value)).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect())
    }

    fn edges(&self, vertex: VertexId, direction: Direction, label: Option<&str>) -> Result<Vec<Edge>> {
        let state = self.state.read()?;
        let mut ids = BTreeSet::new();
        if matches!(direction, Direction::Out | Direction::Both) {
            if let Some(edges) = state.out_edges.lookup(&vertex) {
                ids.extend(edges.iter().copied());
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            if let Some(edges) = state.in_edges.lookup(&vertex) {
                ids.extend(edges.iter().copied());
            }
        }
        Ok(ids
            .into_iter()
            .filter_map(|id| state.edges.get(&id))
            .filter(|edge| label.map(|l| edge.label == l).unwrap_or(true))
            .cloned()
            .collect())
    }

    fn create_index(&self, key: &str) -> Result<()> {
        let mut state = self.state.write()?;
        if state.indexes.contains_key(key) {
            return Ok(());
        }
        let mut index: HashMap<String, RoaringTreemap, OtherHasher> = HashMap::default();
        for (id, properties) in &state.vertices {
            if let Some(value) = properties.get(key) {
                for term in value.index_terms() {
                    index.entry(term).or_default().insert(*id);
                }
            }
        }
        state.indexes.insert(key.to_string(), index);
        debug!("Created property index on '{}'", key);
        Ok(())
    }

    fn indexed_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.state.read()?.indexes.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
