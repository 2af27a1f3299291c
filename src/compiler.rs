//! Resolves a parsed [`Query`] against a type catalog and lowers it to a
//! [`TraversalPlan`]: an ordered list of traversal primitives plus a
//! projection. Compilation never touches the graph, so every unknown name
//! is reported before anything is executed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value as Json;
use tracing::debug;

use crate::datatype::{AttributeDefinition, AttributeInfo, DataType, FieldMapping, StructTypeDefinition, TypeCategory};
use crate::dsl::{ArithOp, CompareOp, Expr, Literal, LoopStep, Query, SourceStep, Step};
use crate::error::{CatalogError, Result};
use crate::graph::Direction;
use crate::instance::Value;
use crate::registry::TypeCatalog;

static RESULT_STRUCT_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Name of the transient struct type describing the rows of a `select`.
pub fn temp_struct_name() -> String {
    format!("__tempQueryResultStruct{}", RESULT_STRUCT_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
}

// ------------- Plan -------------
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    /// Every vertex of a class (subclasses included), trait or struct.
    StartFrom { type_name: String, category: TypeCategory },
    /// Keeps vertices that are of the type, inherit from it or carry it as a trait.
    IsType(String),
    Follow { label: String, direction: Direction },
    Filter(Operand),
    Bind(String),
    /// Repeats the body until no new vertex turns up, or `times` rounds.
    Loop { body: Vec<Primitive>, times: Option<usize> },
}

/// A resolved expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// The bound vertex itself (`None` is the current vertex).
    Entity(Option<String>),
    /// Follows every attribute but the last as a reference, then reads the last.
    Attribute { binding: Option<String>, chain: Vec<AttributeInfo> },
    Arithmetic { op: ArithOp, left: Box<Operand>, right: Box<Operand> },
    Comparison { op: CompareOp, left: Box<Operand>, right: Box<Operand> },
    And(Box<Operand>, Box<Operand>),
    Or(Box<Operand>, Box<Operand>),
    Not(Box<Operand>),
    IsTrait { binding: Option<String>, trait_name: String },
    Has { binding: Option<String>, attribute: AttributeInfo },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub operand: Operand,
    pub data_type_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Entity,
    Select(Vec<Column>),
}

#[derive(Debug, Clone)]
pub struct TraversalPlan {
    pub primitives: Vec<Primitive>,
    pub projection: Projection,
    pub with_path: bool,
    pub limit: Option<usize>,
    /// Type the rows are described by: the traversal's final type, or the
    /// transient result struct of a `select`.
    pub data_type: Json,
}

impl fmt::Display for TraversalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_primitives(f: &mut fmt::Formatter<'_>, primitives: &[Primitive]) -> fmt::Result {
            for (i, p) in primitives.iter().enumerate() {
                if i > 0 {
                    write!(f, ".")?;
                }
                match p {
                    Primitive::StartFrom { type_name, .. } => write!(f, "start({})", type_name)?,
                    Primitive::IsType(t) => write!(f, "isType({})", t)?,
                    Primitive::Follow { label, direction } => write!(f, "{:?}({})", direction, label)?,
                    Primitive::Filter(_) => write!(f, "filter")?,
                    Primitive::Bind(alias) => write!(f, "as({})", alias)?,
                    Primitive::Loop { body, times } => {
                        write!(f, "loop(")?;
                        write_primitives(f, body)?;
                        write!(f, ")")?;
                        if let Some(n) = times {
                            write!(f, ".times({})", n)?;
                        }
                    }
                }
            }
            Ok(())
        }
        write_primitives(f, &self.primitives)
    }
}

// ------------- Compiler -------------
// the type a traversal is positioned on
#[derive(Clone)]
struct Context {
    name: String,
    category: TypeCategory,
    fields: Arc<FieldMapping>,
}

pub struct Compiler<'c> {
    catalog: &'c TypeCatalog,
    scope: HashMap<String, Context>,
}

impl<'c> Compiler<'c> {
    pub fn new(catalog: &'c TypeCatalog) -> Self {
        Self { catalog, scope: HashMap::new() }
    }

    pub fn compile(mut self, query: &Query) -> Result<TraversalPlan> {
        let (first, rest) = query
            .steps
            .split_first()
            .ok_or_else(|| CatalogError::InvalidQuery("a query needs at least one step".to_string()))?;
        let Step::Source(source) = first else {
            return Err(CatalogError::InvalidQuery("a query cannot start with a loop".to_string()));
        };
        let mut primitives = Vec::new();
        let mut current = self.start(source, &mut primitives)?;
        for step in rest {
            current = self.step(&current, step, &mut primitives)?;
        }

        let projection;
        let data_type;
        if query.select.is_empty() {
            projection = Projection::Entity;
            data_type = describe_type(self.catalog, current.category, &current.name)?;
        } else {
            let mut columns = Vec::new();
            for (i, item) in query.select.iter().enumerate() {
                let operand = self.operand(&current, &item.expr)?;
                let name = match (&item.alias, &item.expr) {
                    (Some(alias), _) => alias.clone(),
                    (None, Expr::Path(segments)) => segments.join("."),
                    (None, _) => format!("_col_{}", i),
                };
                let data_type_name = self.operand_type(&operand);
                columns.push(Column { name, operand, data_type_name });
            }
            let definition = StructTypeDefinition::new(
                &temp_struct_name(),
                columns
                    .iter()
                    .map(|c| AttributeDefinition::optional(&c.name, &c.data_type_name))
                    .collect(),
            );
            data_type = serde_json::to_value(definition)?;
            projection = Projection::Select(columns);
        }

        let plan = TraversalPlan {
            primitives,
            projection,
            with_path: query.with_path,
            limit: query.limit,
            data_type,
        };
        debug!("Compiled query plan {}", plan);
        Ok(plan)
    }

    fn context(&self, name: &str) -> Option<Context> {
        let category = self.catalog.category_of(name)?;
        let fields = self.catalog.get(category, name)?.field_mapping()?;
        Some(Context { name: name.to_string(), category, fields: Arc::clone(fields) })
    }

    fn bind(&mut self, alias: &str, context: &Context, primitives: &mut Vec<Primitive>) {
        self.scope.insert(alias.to_string(), context.clone());
        primitives.push(Primitive::Bind(alias.to_string()));
    }

    fn start(&mut self, source: &SourceStep, primitives: &mut Vec<Primitive>) -> Result<Context> {
        let context = self
            .context(&source.name)
            .ok_or_else(|| CatalogError::UnknownType(source.name.clone()))?;
        primitives.push(Primitive::StartFrom { type_name: context.name.clone(), category: context.category });
        self.finish_step(source, &context, true, primitives)?;
        Ok(context)
    }

    // aliases first, so filters can refer to the step by name
    fn finish_step(
        &mut self,
        source: &SourceStep,
        context: &Context,
        names_type: bool,
        primitives: &mut Vec<Primitive>,
    ) -> Result<()> {
        if names_type {
            self.bind(&source.name, context, primitives);
        }
        if let Some(alias) = &source.alias {
            self.bind(alias, context, primitives);
        }
        for filter in &source.filters {
            let operand = self.operand(context, filter)?;
            primitives.push(Primitive::Filter(operand));
        }
        Ok(())
    }

    fn step(&mut self, current: &Context, step: &Step, primitives: &mut Vec<Primitive>) -> Result<Context> {
        match step {
            Step::Source(source) => {
                let (next, names_type) = self.follow(current, &source.name, primitives)?;
                self.finish_step(source, &next, names_type, primitives)?;
                Ok(next)
            }
            Step::Loop(looped) => self.looped(current, looped, primitives),
        }
    }

    fn related(&self, a: &str, b: &str) -> bool {
        self.catalog.is_subtype(a, b) || self.catalog.is_subtype(b, a)
    }

    // Resolves one step from `current`: an attribute of the current type, a
    // type the current type references, or a type referencing it. A type name
    // walks the first matching reference in declaration order, forward ones
    // before those of the named type pointing back.
    fn follow(&self, current: &Context, name: &str, primitives: &mut Vec<Primitive>) -> Result<(Context, bool)> {
        if let Some(info) = current.fields.get(name) {
            let target = info.data_type.target_name().filter(|_| info.data_type.is_edge());
            let next = target.and_then(|t| self.context(t)).ok_or_else(|| {
                CatalogError::InvalidQuery(format!("'{}' of '{}' is not a reference", name, current.name))
            })?;
            primitives.push(Primitive::Follow { label: info.property_key(), direction: Direction::Out });
            return Ok((next, false));
        }
        let Some(next) = self.context(name) else {
            return Err(CatalogError::UnknownAttribute { type_name: current.name.clone(), attribute: name.to_string() });
        };
        let forward = current.fields.iter().find(|i| {
            i.data_type.is_edge() && i.data_type.target_name().is_some_and(|t| self.related(t, name))
        });
        let (label, direction) = match forward {
            Some(info) => (info.property_key(), Direction::Out),
            None => {
                let reverse = next.fields.iter().find(|i| {
                    i.data_type.is_edge() && i.data_type.target_name().is_some_and(|t| self.related(t, &current.name))
                });
                match reverse {
                    Some(info) => (info.property_key(), Direction::In),
                    None => {
                        return Err(CatalogError::InvalidQuery(format!(
                            "no reference between '{}' and '{}'",
                            current.name, name
                        )));
                    }
                }
            }
        };
        primitives.push(Primitive::Follow { label, direction });
        primitives.push(Primitive::IsType(name.to_string()));
        Ok((next, true))
    }

    fn looped(&mut self, current: &Context, looped: &LoopStep, primitives: &mut Vec<Primitive>) -> Result<Context> {
        let mut body = Vec::new();
        let mut position = current.clone();
        for step in &looped.body {
            position = self.step(&position, step, &mut body)?;
        }
        if body.is_empty() || !self.related(&position.name, &current.name) {
            return Err(CatalogError::InvalidQuery(format!(
                "a loop starting at '{}' must end at '{}', not '{}'",
                current.name, current.name, position.name
            )));
        }
        if looped.times == Some(0) {
            return Err(CatalogError::InvalidQuery("a loop must run at least once".to_string()));
        }
        primitives.push(Primitive::Loop { body, times: looped.times });
        if let Some(alias) = &looped.alias {
            self.bind(alias, current, primitives);
        }
        Ok(current.clone())
    }

    // ------------- Expressions -------------
    fn operand(&self, current: &Context, expr: &Expr) -> Result<Operand> {
        Ok(match expr {
            Expr::Literal(literal) => Operand::Literal(match literal {
                Literal::String(s) => Value::String(s.clone()),
                Literal::Long(v) => Value::Long(*v),
                Literal::Double(v) => Value::Double(*v),
                Literal::Boolean(v) => Value::Boolean(*v),
                Literal::Null => Value::Null,
            }),
            Expr::Path(segments) => self.path(current, segments)?,
            Expr::Arithmetic { op, left, right } => Operand::Arithmetic {
                op: *op,
                left: Box::new(self.operand(current, left)?),
                right: Box::new(self.operand(current, right)?),
            },
            Expr::Comparison { op, left, right } => Operand::Comparison {
                op: *op,
                left: Box::new(self.operand(current, left)?),
                right: Box::new(self.operand(current, right)?),
            },
            Expr::And(l, r) => Operand::And(Box::new(self.operand(current, l)?), Box::new(self.operand(current, r)?)),
            Expr::Or(l, r) => Operand::Or(Box::new(self.operand(current, l)?), Box::new(self.operand(current, r)?)),
            Expr::Not(e) => Operand::Not(Box::new(self.operand(current, e)?)),
            Expr::IsTrait { subject, trait_name } => {
                if self.catalog.trait_type(trait_name).is_none() {
                    return Err(CatalogError::UnknownType(trait_name.clone()));
                }
                let (binding, _) = self.subject(current, subject.as_deref())?;
                Operand::IsTrait { binding, trait_name: trait_name.clone() }
            }
            Expr::Has { subject, attribute } => {
                let (binding, context) = self.subject(current, subject.as_deref())?;
                let info = context.fields.get(attribute).cloned().ok_or_else(|| CatalogError::UnknownAttribute {
                    type_name: context.name.clone(),
                    attribute: attribute.clone(),
                })?;
                Operand::Has { binding, attribute: info }
            }
        })
    }

    // the binding an `is`/`has` test applies to
    fn subject(&self, current: &Context, subject: Option<&[String]>) -> Result<(Option<String>, Context)> {
        match subject {
            None => Ok((None, current.clone())),
            Some([alias]) => match self.scope.get(alias) {
                Some(context) => Ok((Some(alias.clone()), context.clone())),
                None => Err(CatalogError::UnknownType(alias.clone())),
            },
            Some(other) => Err(CatalogError::InvalidQuery(format!(
                "'{}' does not name a step of the query",
                other.join(".")
            ))),
        }
    }

    fn path(&self, current: &Context, segments: &[String]) -> Result<Operand> {
        let Some((head, tail)) = segments.split_first() else {
            return Err(CatalogError::InvalidQuery("empty path".to_string()));
        };
        // a lone name is an attribute of the current type before it is an alias
        let (binding, mut context, rest) = match self.scope.get(head) {
            Some(context) if !(tail.is_empty() && current.fields.contains(head)) => {
                (Some(head.clone()), context.clone(), tail)
            }
            _ => (None, current.clone(), segments),
        };
        if rest.is_empty() {
            return Ok(Operand::Entity(binding));
        }
        let mut chain = Vec::new();
        for (i, segment) in rest.iter().enumerate() {
            let info = context.fields.get(segment).cloned().ok_or_else(|| CatalogError::UnknownAttribute {
                type_name: context.name.clone(),
                attribute: segment.clone(),
            })?;
            if i + 1 < rest.len() {
                context = info
                    .data_type
                    .target_name()
                    .filter(|_| info.data_type.is_edge())
                    .and_then(|t| self.context(t))
                    .ok_or_else(|| {
                        CatalogError::InvalidQuery(format!("'{}' of '{}' is not a reference", segment, context.name))
                    })?;
            }
            chain.push(info);
        }
        Ok(Operand::Attribute { binding, chain })
    }

    fn operand_type(&self, operand: &Operand) -> String {
        match operand {
            Operand::Literal(v) => match v {
                Value::Null => "string".to_string(),
                other => other.kind().to_string(),
            },
            Operand::Entity(binding) => binding
                .as_ref()
                .and_then(|b| self.scope.get(b))
                .map(|c| c.name.clone())
                .unwrap_or_else(|| "string".to_string()),
            Operand::Attribute { chain, .. } => chain
                .last()
                .map(|info| info.data_type.name())
                .unwrap_or_else(|| "string".to_string()),
            Operand::Arithmetic { left, right, op } => {
                let (l, r) = (self.operand_type(left), self.operand_type(right));
                if l == "string" || r == "string" {
                    "string".to_string()
                } else if is_integral(&l) && is_integral(&r) && *op != ArithOp::Div {
                    "long".to_string()
                } else {
                    "double".to_string()
                }
            }
            _ => "boolean".to_string(),
        }
    }
}

/// The wire definition of a class, trait or struct as JSON.
pub fn describe_type(catalog: &TypeCatalog, category: TypeCategory, name: &str) -> Result<Json> {
    Ok(match catalog.get(category, name) {
        Some(DataType::Struct(s)) => serde_json::to_value(s.to_definition())?,
        Some(DataType::Class(h)) | Some(DataType::Trait(h)) => serde_json::to_value(h.to_definition())?,
        _ => Json::Null,
    })
}

fn is_integral(type_name: &str) -> bool {
    matches!(type_name, "byte" | "short" | "int" | "long" | "biginteger")
}

/// Compiles a parsed query against one catalog snapshot.
pub fn compile(query: &Query, catalog: &TypeCatalog) -> Result<TraversalPlan> {
    Compiler::new(catalog).compile(query)
}
