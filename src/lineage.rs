//! Table lineage over the graph: which tables feed a table, which tables it
//! feeds, and what columns it has. The process and table types involved are
//! named in [`LineageConfig`].

use std::sync::Arc;

use tracing::info;

use crate::compiler::{Operand, Primitive, Projection, TraversalPlan, describe_type};
use crate::config::LineageConfig;
use crate::datatype::{AttributeInfo, TypeCategory};
use crate::discovery::{DiscoveryService, QueryResult};
use crate::dsl::CompareOp;
use crate::error::{CatalogError, Result};
use crate::graph::Direction;
use crate::instance::Value;
use crate::registry::{TypeCatalog, TypeRegistry};

pub struct LineageService {
    registry: Arc<TypeRegistry>,
    discovery: Arc<DiscoveryService>,
    config: LineageConfig,
}

#[derive(Clone, Copy)]
enum Flow {
    Upstream,
    Downstream,
}

impl LineageService {
    pub fn new(registry: Arc<TypeRegistry>, discovery: Arc<DiscoveryService>, config: LineageConfig) -> Self {
        Self { registry, discovery, config }
    }

    /// Every table the named table is derived from, with the path to it.
    pub fn inputs(&self, table: &str) -> Result<QueryResult> {
        self.lineage(table, Flow::Upstream)
    }

    /// Every table derived from the named table, with the path to it.
    pub fn outputs(&self, table: &str) -> Result<QueryResult> {
        self.lineage(table, Flow::Downstream)
    }

    /// The columns of the named table.
    pub fn schema(&self, table: &str) -> Result<QueryResult> {
        let description = format!("schema of {} '{}'", self.config.table_type, table);
        let catalog = self.registry.snapshot()?;
        let columns = self.attribute(&catalog, &self.config.table_type, &self.config.columns_attribute)?;
        let column_type = columns
            .data_type
            .target_name()
            .ok_or_else(|| {
                CatalogError::InvalidQuery(format!("'{}' does not reference columns", columns.property_key()))
            })?
            .to_string();
        let mut primitives = self.named_table(&catalog, table)?;
        primitives.push(Primitive::Follow { label: columns.property_key(), direction: Direction::Out });
        let plan = TraversalPlan {
            primitives,
            projection: Projection::Entity,
            with_path: false,
            limit: None,
            data_type: describe_type(&catalog, TypeCategory::Class, &column_type)?,
        };
        self.run(&description, plan, &catalog)
    }

    fn lineage(&self, table: &str, flow: Flow) -> Result<QueryResult> {
        let direction = match flow {
            Flow::Upstream => "inputs",
            Flow::Downstream => "outputs",
        };
        let description = format!("{} of {} '{}'", direction, self.config.table_type, table);
        let catalog = self.registry.snapshot()?;
        let inputs = self.attribute(&catalog, &self.config.process_type, &self.config.inputs_attribute)?;
        let outputs = self.attribute(&catalog, &self.config.process_type, &self.config.outputs_attribute)?;
        // into a process through one side, out of it through the other
        let (arrive, leave) = match flow {
            Flow::Upstream => (outputs, inputs),
            Flow::Downstream => (inputs, outputs),
        };
        let mut primitives = self.named_table(&catalog, table)?;
        primitives.push(Primitive::Loop {
            body: vec![
                Primitive::Follow { label: arrive.property_key(), direction: Direction::In },
                Primitive::IsType(self.config.process_type.clone()),
                Primitive::Follow { label: leave.property_key(), direction: Direction::Out },
            ],
            times: None,
        });
        let plan = TraversalPlan {
            primitives,
            projection: Projection::Entity,
            with_path: true,
            limit: None,
            data_type: describe_type(&catalog, TypeCategory::Class, &self.config.table_type)?,
        };
        self.run(&description, plan, &catalog)
    }

    fn attribute(&self, catalog: &TypeCatalog, type_name: &str, attribute: &str) -> Result<AttributeInfo> {
        catalog
            .require_class(type_name)?
            .field_mapping
            .get(attribute)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownAttribute {
                type_name: type_name.to_string(),
                attribute: attribute.to_string(),
            })
    }

    // start at tables whose name attribute equals `table`
    fn named_table(&self, catalog: &TypeCatalog, table: &str) -> Result<Vec<Primitive>> {
        let name = self.attribute(catalog, &self.config.table_type, &self.config.name_attribute)?;
        Ok(vec![
            Primitive::StartFrom { type_name: self.config.table_type.clone(), category: TypeCategory::Class },
            Primitive::Filter(Operand::Comparison {
                op: CompareOp::Eq,
                left: Box::new(Operand::Attribute { binding: None, chain: vec![name] }),
                right: Box::new(Operand::Literal(Value::String(table.to_string()))),
            }),
        ])
    }

    fn run(&self, description: &str, plan: TraversalPlan, catalog: &TypeCatalog) -> Result<QueryResult> {
        let rows = self
            .discovery
            .run(&plan, catalog)
            .map_err(|e| CatalogError::discovery(description, e))?;
        info!("Lineage {} found {} rows", description, rows.len());
        Ok(QueryResult { query: plan.to_string(), data_type: plan.data_type, rows })
    }
}
