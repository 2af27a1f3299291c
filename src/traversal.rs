//! Runs a [`TraversalPlan`] against the graph.
//!
//! A traversal moves a set of traversers through the plan's primitives. Each
//! traverser sits on one vertex and remembers the vertices bound to aliases
//! and the path it took to get there. Rows are built from the traversers
//! that survive to the end.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use roaring::RoaringTreemap;
use serde_json::{Map, Value as Json};
use tracing::{debug, warn};

use crate::compiler::{Column, Operand, Primitive, Projection, TraversalPlan};
use crate::datatype::{AttributeInfo, FieldMapping, PrimitiveKind, TypeCategory};
use crate::dsl::{ArithOp, CompareOp};
use crate::error::{CatalogError, Result};
use crate::graph::{
    Direction, INDEX_KEY, OtherHasher, PropertyValue, SUPER_TYPES_KEY, TRAIT_NAMES_KEY, TYPE_NAME_KEY, Vertex,
    VertexId,
};
use crate::identity::Id;
use crate::instance::{Value, convert_primitive};
use crate::registry::TypeCatalog;
use crate::repository::GraphRepository;
use crate::serialization::value_to_json;

pub const TYPE_NAME_FIELD: &str = "$typeName$";
pub const ID_FIELD: &str = "$id$";
pub const PATH_FIELD: &str = "path";
pub const EDGE_FIELD: &str = "$edge$";

#[derive(Debug, Clone)]
struct Traverser {
    vertex: VertexId,
    // later bindings shadow earlier ones
    bindings: Vec<(String, VertexId)>,
    path: Vec<VertexId>,
    // the edge taken into each vertex of the path after the first
    edges: Vec<(String, Direction)>,
}
impl Traverser {
    fn start(vertex: VertexId) -> Self {
        Self { vertex, bindings: Vec::new(), path: vec![vertex], edges: Vec::new() }
    }
    fn moved_to(&self, vertex: VertexId, label: &str, direction: Direction) -> Self {
        let mut next = self.clone();
        next.vertex = vertex;
        next.path.push(vertex);
        next.edges.push((label.to_string(), direction));
        next
    }
    fn bound(&self, binding: &Option<String>) -> Option<VertexId> {
        match binding {
            None => Some(self.vertex),
            Some(alias) => self.bindings.iter().rev().find(|(a, _)| a == alias).map(|(_, v)| *v),
        }
    }
}

pub struct Executor<'e> {
    repository: &'e GraphRepository,
    catalog: &'e TypeCatalog,
    max_loop_depth: usize,
    vertices: RefCell<HashMap<VertexId, Rc<Vertex>, OtherHasher>>,
}

impl<'e> Executor<'e> {
    pub fn new(repository: &'e GraphRepository, catalog: &'e TypeCatalog, max_loop_depth: usize) -> Self {
        Self { repository, catalog, max_loop_depth, vertices: RefCell::new(HashMap::default()) }
    }

    /// Runs the plan and returns one JSON row per result.
    pub fn execute(&self, plan: &TraversalPlan) -> Result<Vec<Json>> {
        let traversers = self.run(&plan.primitives, Vec::new())?;
        debug!("Traversal of {} ended with {} traversers", plan, traversers.len());
        let result_type = plan.data_type.get("typeName").and_then(Json::as_str).unwrap_or_default();
        let mut rows = Vec::new();
        let mut seen = RoaringTreemap::new();
        for traverser in traversers {
            if plan.limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
            let mut row = match &plan.projection {
                Projection::Entity => {
                    // entities are reported once unless each path matters
                    if !plan.with_path && !seen.insert(traverser.vertex) {
                        continue;
                    }
                    self.vertex_row(traverser.vertex)?
                }
                Projection::Select(columns) => self.select_row(columns, &traverser, result_type)?,
            };
            if plan.with_path {
                let mut path = Vec::with_capacity(traverser.path.len());
                for (n, v) in traverser.path.iter().enumerate() {
                    let mut step = self.vertex_row(*v)?;
                    if let Some((label, direction)) = n.checked_sub(1).and_then(|e| traverser.edges.get(e)) {
                        step.insert(EDGE_FIELD.to_string(), edge_json(label, *direction));
                    }
                    path.push(Json::Object(step));
                }
                row.insert(PATH_FIELD.to_string(), Json::Array(path));
            }
            rows.push(Json::Object(row));
        }
        Ok(rows)
    }

    fn vertex(&self, id: VertexId) -> Result<Rc<Vertex>> {
        if let Some(vertex) = self.vertices.borrow().get(&id) {
            return Ok(Rc::clone(vertex));
        }
        let vertex = self
            .repository
            .graph()
            .vertex(id)?
            .map(Rc::new)
            .ok_or_else(|| CatalogError::Repository(format!("vertex {} disappeared during traversal", id)))?;
        self.vertices.borrow_mut().insert(id, Rc::clone(&vertex));
        Ok(vertex)
    }

    // ------------- Primitives -------------
    fn run(&self, primitives: &[Primitive], mut traversers: Vec<Traverser>) -> Result<Vec<Traverser>> {
        for primitive in primitives {
            traversers = match primitive {
                Primitive::StartFrom { type_name, category } => self.start(type_name, *category)?,
                Primitive::IsType(type_name) => {
                    let mut kept = Vec::new();
                    for t in traversers {
                        if is_of_type(&*self.vertex(t.vertex)?, type_name) {
                            kept.push(t);
                        }
                    }
                    kept
                }
                Primitive::Follow { label, direction } => {
                    let mut moved = Vec::new();
                    for t in &traversers {
                        let mut edges = self.repository.graph().edges(t.vertex, *direction, Some(label))?;
                        edges.sort_by_key(|e| e.properties.get(INDEX_KEY).and_then(PropertyValue::as_i64).unwrap_or(0));
                        moved.extend(edges.iter().map(|e| t.moved_to(e.other(t.vertex), label, *direction)));
                    }
                    moved
                }
                Primitive::Filter(operand) => {
                    let mut kept = Vec::new();
                    for t in traversers {
                        if matches!(self.eval(operand, &t)?, Value::Boolean(true)) {
                            kept.push(t);
                        }
                    }
                    kept
                }
                Primitive::Bind(alias) => traversers
                    .into_iter()
                    .map(|mut t| {
                        t.bindings.push((alias.clone(), t.vertex));
                        t
                    })
                    .collect(),
                Primitive::Loop { body, times } => self.repeat(body, *times, traversers)?,
            };
        }
        Ok(traversers)
    }

    fn start(&self, type_name: &str, category: TypeCategory) -> Result<Vec<Traverser>> {
        let graph = self.repository.graph();
        let mut found = RoaringTreemap::new();
        match category {
            TypeCategory::Class => {
                for class in self.catalog.class_and_subtypes(type_name) {
                    found.extend(graph.vertices_where(TYPE_NAME_KEY, &PropertyValue::String(class))?);
                }
            }
            TypeCategory::Trait => {
                found.extend(graph.vertices_where(TRAIT_NAMES_KEY, &PropertyValue::String(type_name.to_string()))?);
            }
            _ => {
                found.extend(graph.vertices_where(TYPE_NAME_KEY, &PropertyValue::String(type_name.to_string()))?);
            }
        }
        Ok(found.iter().map(Traverser::start).collect())
    }

    // Each traverser explores on its own; a vertex is emitted the first time
    // it is reached and the start vertex never is.
    fn repeat(&self, body: &[Primitive], times: Option<usize>, traversers: Vec<Traverser>) -> Result<Vec<Traverser>> {
        let bound = times.unwrap_or(self.max_loop_depth);
        let mut emitted = Vec::new();
        for traverser in traversers {
            let mut visited = RoaringTreemap::new();
            visited.insert(traverser.vertex);
            let mut frontier = vec![traverser];
            let mut depth = 0;
            while !frontier.is_empty() && depth < bound {
                depth += 1;
                frontier = self
                    .run(body, frontier)?
                    .into_iter()
                    .filter(|t| visited.insert(t.vertex))
                    .collect();
                emitted.extend(frontier.iter().cloned());
            }
            if times.is_none() && !frontier.is_empty() {
                warn!("Loop stopped after {} rounds without reaching a fixed point", bound);
            }
        }
        Ok(emitted)
    }

    // ------------- Expressions -------------
    fn eval(&self, operand: &Operand, t: &Traverser) -> Result<Value> {
        Ok(match operand {
            Operand::Literal(value) => value.clone(),
            Operand::Entity(binding) => match t.bound(binding) {
                Some(v) => GraphRepository::entity_id(&*self.vertex(v)?).map(Value::Id).unwrap_or(Value::Null),
                None => Value::Null,
            },
            Operand::Attribute { binding, chain } => match t.bound(binding) {
                Some(v) => self.attribute(v, chain)?,
                None => Value::Null,
            },
            Operand::Arithmetic { op, left, right } => arithmetic(*op, &self.eval(left, t)?, &self.eval(right, t)?),
            Operand::Comparison { op, left, right } => {
                Value::Boolean(compare(*op, &self.eval(left, t)?, &self.eval(right, t)?))
            }
            Operand::And(l, r) => Value::Boolean(self.holds(l, t)? && self.holds(r, t)?),
            Operand::Or(l, r) => Value::Boolean(self.holds(l, t)? || self.holds(r, t)?),
            Operand::Not(e) => Value::Boolean(!self.holds(e, t)?),
            Operand::IsTrait { binding, trait_name } => match t.bound(binding) {
                Some(v) => Value::Boolean(self.vertex(v)?.property(TRAIT_NAMES_KEY).is_some_and(|names| {
                    names.matches(&PropertyValue::String(trait_name.clone()))
                })),
                None => Value::Boolean(false),
            },
            Operand::Has { binding, attribute } => match t.bound(binding) {
                Some(v) if attribute.data_type.is_edge() => Value::Boolean(
                    !self
                        .repository
                        .graph()
                        .edges(v, Direction::Out, Some(&attribute.property_key()))?
                        .is_empty(),
                ),
                Some(v) => Value::Boolean(self.vertex(v)?.property(&attribute.property_key()).is_some()),
                None => Value::Boolean(false),
            },
        })
    }

    fn holds(&self, operand: &Operand, t: &Traverser) -> Result<bool> {
        Ok(matches!(self.eval(operand, t)?, Value::Boolean(true)))
    }

    fn attribute(&self, vertex: VertexId, chain: &[AttributeInfo]) -> Result<Value> {
        let Some((last, hops)) = chain.split_last() else {
            return Ok(Value::Null);
        };
        let mut current = vertex;
        for info in hops {
            let edges = self.repository.graph().edges(current, Direction::Out, Some(&info.property_key()))?;
            match edges.first() {
                Some(edge) => current = edge.in_vertex,
                None => return Ok(Value::Null),
            }
        }
        self.repository.attribute_value(&*self.vertex(current)?, last, self.catalog)
    }

    // ------------- Rows -------------
    fn fields_of(&self, type_name: &str) -> Option<&FieldMapping> {
        self.catalog
            .hierarchical(type_name)
            .map(|h| h.field_mapping.as_ref())
            .or_else(|| self.catalog.struct_type(type_name).map(|s| s.field_mapping.as_ref()))
    }

    fn vertex_row(&self, id: VertexId) -> Result<Map<String, Json>> {
        let vertex = self.vertex(id)?;
        let type_name = vertex.string(TYPE_NAME_KEY).unwrap_or_default().to_string();
        let mut row = Map::new();
        row.insert(TYPE_NAME_FIELD.to_string(), Json::String(type_name.clone()));
        if let Some(entity) = GraphRepository::entity_id(&*vertex) {
            row.insert(ID_FIELD.to_string(), reference_json(&entity));
        }
        if let Some(fields) = self.fields_of(&type_name) {
            for info in fields.iter() {
                let value = self.repository.attribute_value(&*vertex, info, self.catalog)?;
                row.insert(info.name.clone(), row_value(&value));
            }
        }
        Ok(row)
    }

    fn select_row(&self, columns: &[Column], t: &Traverser, result_type: &str) -> Result<Map<String, Json>> {
        let mut row = Map::new();
        row.insert(TYPE_NAME_FIELD.to_string(), Json::String(result_type.to_string()));
        for column in columns {
            row.insert(column.name.clone(), row_value(&self.eval(&column.operand, t)?));
        }
        Ok(row)
    }
}

fn is_of_type(vertex: &Vertex, type_name: &str) -> bool {
    let name = PropertyValue::String(type_name.to_string());
    vertex.string(TYPE_NAME_KEY) == Some(type_name)
        || vertex.property(SUPER_TYPES_KEY).is_some_and(|p| p.matches(&name))
        || vertex.property(TRAIT_NAMES_KEY).is_some_and(|p| p.matches(&name))
}

// `{label, direction}` of the edge a path step was reached by
fn edge_json(label: &str, direction: Direction) -> Json {
    let direction = match direction {
        Direction::Out => "out",
        Direction::In => "in",
        Direction::Both => "both",
    };
    let mut object = Map::new();
    object.insert("label".to_string(), Json::String(label.to_string()));
    object.insert("direction".to_string(), Json::String(direction.to_string()));
    Json::Object(object)
}

fn reference_json(id: &Id) -> Json {
    let mut object = Map::new();
    object.insert("id".to_string(), Json::String(id.id().to_string()));
    object.insert(TYPE_NAME_FIELD.to_string(), Json::String(id.type_name().to_string()));
    object.insert("version".to_string(), Json::from(id.version()));
    Json::Object(object)
}

/// Row form of a value: references as `{id, $typeName$, version}`, structs
/// flattened with their type name.
pub fn row_value(value: &Value) -> Json {
    match value {
        Value::Id(id) => reference_json(id),
        Value::Array(items) => Json::Array(items.iter().map(row_value).collect()),
        Value::Map(entries) => Json::Object(entries.iter().map(|(k, v)| (k.to_string(), row_value(v))).collect()),
        Value::Struct(s) => {
            let mut object = Map::new();
            object.insert(TYPE_NAME_FIELD.to_string(), Json::String(s.type_name.clone()));
            for (name, v) in &s.values {
                object.insert(name.clone(), row_value(v));
            }
            Json::Object(object)
        }
        other => value_to_json(other),
    }
}

// ------------- Value semantics -------------
fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::Long(_) | Value::BigInteger(_) => value.as_i64(),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::String(_) | Value::Enum(_) | Value::Boolean(_) | Value::Date(_) => None,
        other => other.as_f64(),
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Enum(e) => Some(e.value.clone()),
        Value::Id(id) => Some(id.id().to_string()),
        Value::Array(_) | Value::Map(_) | Value::Struct(_) | Value::TypedStruct(_) => None,
        Value::Referenceable(_) | Value::Instance(_) | Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Null in, null out. `+` concatenates when either side is text.
pub fn arithmetic(op: ArithOp, left: &Value, right: &Value) -> Value {
    if left.is_null() || right.is_null() {
        return Value::Null;
    }
    if op == ArithOp::Add && (left.as_str().is_some() || right.as_str().is_some()) {
        return Value::String(format!("{}{}", left, right));
    }
    if let (Some(l), Some(r), true) = (integral(left), integral(right), op != ArithOp::Div) {
        let result = match op {
            ArithOp::Add => l.checked_add(r),
            ArithOp::Sub => l.checked_sub(r),
            _ => l.checked_mul(r),
        };
        if let Some(v) = result {
            return Value::Long(v);
        }
    }
    match (numeric(left), numeric(right)) {
        (Some(l), Some(r)) => Value::Double(match op {
            ArithOp::Add => l + r,
            ArithOp::Sub => l - r,
            ArithOp::Mul => l * r,
            ArithOp::Div => l / r,
        }),
        _ => Value::Null,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        (Value::Date(_), other) => order(left, &convert_primitive(PrimitiveKind::Date, other).ok()?),
        (other, Value::Date(_)) => order(&convert_primitive(PrimitiveKind::Date, other).ok()?, right),
        _ => match (numeric(left), numeric(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(text(left)?.cmp(&text(right)?)),
        },
    }
}

/// A multi-valued left side matches when any of its values does (`!=` when
/// none equals the right side).
pub fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    if let (Value::Array(items), false) = (left, matches!(right, Value::Array(_))) {
        return match op {
            CompareOp::Ne => items.iter().all(|i| compare(op, i, right)),
            _ => items.iter().any(|i| compare(op, i, right)),
        };
    }
    match order(left, right) {
        Some(ordering) => match op {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        },
        None => op == CompareOp::Ne,
    }
}
