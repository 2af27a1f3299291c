//! Search entry points: the query DSL, raw graph traversals and free text.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::compiler::{TraversalPlan, compile};
use crate::config::QueryConfig;
use crate::dsl::parse_query;
use crate::error::{CatalogError, Result};
use crate::fulltext::{FullTextIndex, SearchHit};
use crate::gremlin;
use crate::registry::TypeCatalog;
use crate::repository::GraphRepository;
use crate::traversal::Executor;

/// The response to a DSL query. `data_type` describes the rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query: String,
    pub data_type: Json,
    pub rows: Vec<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullTextResult {
    pub query: String,
    pub results: Vec<SearchHit>,
}

/// What [`DiscoveryService::search`] ended up running.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "queryType")]
pub enum SearchResponse {
    #[serde(rename = "gremlin")]
    Gremlin { query: String, results: Vec<BTreeMap<String, String>> },
    #[serde(rename = "dsl")]
    Dsl(QueryResult),
    #[serde(rename = "full-text")]
    FullText(FullTextResult),
}

pub struct DiscoveryService {
    repository: Arc<GraphRepository>,
    full_text: Option<Arc<dyn FullTextIndex>>,
    query: QueryConfig,
}

impl DiscoveryService {
    pub fn new(repository: Arc<GraphRepository>, full_text: Option<Arc<dyn FullTextIndex>>, query: QueryConfig) -> Self {
        Self { repository, full_text, query }
    }

    /// Parses, compiles and runs a DSL query. Syntax errors surface as
    /// [`CatalogError::QueryParse`]; anything that goes wrong after parsing
    /// is wrapped in [`CatalogError::Discovery`].
    pub fn search_by_dsl(&self, text: &str) -> Result<QueryResult> {
        let query = parse_query(text)?;
        let catalog = self.repository.registry().snapshot().map_err(|e| CatalogError::discovery(text, e))?;
        let mut plan = compile(&query, &catalog).map_err(|e| CatalogError::discovery(text, e))?;
        if plan.limit.is_none() {
            plan.limit = self.query.default_limit;
        }
        let rows = self.run(&plan, &catalog).map_err(|e| CatalogError::discovery(text, e))?;
        info!("Query '{}' returned {} rows", text, rows.len());
        Ok(QueryResult { query: text.to_string(), data_type: plan.data_type, rows })
    }

    /// Runs an already compiled plan against one catalog snapshot.
    pub fn run(&self, plan: &TraversalPlan, catalog: &TypeCatalog) -> Result<Vec<Json>> {
        Executor::new(&self.repository, catalog, self.query.max_loop_depth).execute(plan)
    }

    pub fn search_by_gremlin(&self, text: &str) -> Result<Vec<BTreeMap<String, String>>> {
        gremlin::search(self.repository.graph().as_ref(), text).map_err(|e| CatalogError::discovery(text, e))
    }

    pub fn search_by_full_text(&self, text: &str) -> Result<FullTextResult> {
        let index = self.full_text.as_ref().ok_or_else(|| {
            CatalogError::discovery(text, CatalogError::InvalidQuery("full-text search is disabled".to_string()))
        })?;
        let results = index.search(text).map_err(|e| CatalogError::discovery(text, e))?;
        Ok(FullTextResult { query: text.to_string(), results })
    }

    /// `g.` text is a raw traversal. Anything else is tried as a DSL query,
    /// and text that does not parse or names no known type is searched as
    /// free text instead.
    pub fn search(&self, text: &str) -> Result<SearchResponse> {
        let trimmed = text.trim();
        if trimmed.starts_with("g.") {
            let results = self.search_by_gremlin(trimmed)?;
            return Ok(SearchResponse::Gremlin { query: trimmed.to_string(), results });
        }
        match self.search_by_dsl(trimmed) {
            Ok(result) => Ok(SearchResponse::Dsl(result)),
            Err(e) if self.full_text.is_some() && falls_back(&e) => {
                debug!("'{}' is not a usable query ({}), searching free text", trimmed, e);
                Ok(SearchResponse::FullText(self.search_by_full_text(trimmed)?))
            }
            Err(e) => Err(e),
        }
    }
}

fn falls_back(e: &CatalogError) -> bool {
    matches!(
        e.root_cause(),
        CatalogError::QueryParse { .. } | CatalogError::UnknownType(_) | CatalogError::UnknownAttribute { .. }
    )
}
