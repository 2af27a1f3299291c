//! Free-text search over entities.
//!
//! Each entity becomes one document made of its own scalar values, the values
//! of its structs and traits, the trait names, and the scalar values of the
//! entities its single-valued references point at (composite children are
//! documents of their own). A query matches a document when every query term
//! occurs in it.

use std::collections::HashMap;
use std::sync::RwLock;

use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::instance::{Instance, TypedInstance, TypedStruct, Value};
use crate::listener::EntityChangeListener;

lazy_static! {
    static ref TERM: Regex = Regex::new(r"[\p{L}\p{N}_]+").unwrap();
}

pub fn tokenize(text: &str) -> Vec<String> {
    TERM.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub guid: String,
    pub type_name: String,
    pub score: usize,
}

pub trait FullTextIndex: Send + Sync {
    /// Documents containing every term of `query`, best first.
    fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
    fn document_count(&self) -> Result<usize>;
}

#[derive(Debug, Default)]
struct Document {
    type_name: String,
    terms: Vec<String>,
    traits: IndexMap<String, Vec<String>>,
}
impl Document {
    fn occurrences(&self, term: &str) -> usize {
        self.terms
            .iter()
            .chain(self.traits.values().flatten())
            .filter(|t| t.as_str() == term)
            .count()
    }
}

#[derive(Debug, Default)]
struct TextState {
    // scalar terms of each entity, lent to the entities referencing it
    own: HashMap<String, Vec<String>>,
    documents: HashMap<String, Document>,
}

#[derive(Debug, Default)]
pub struct MemoryFullTextIndex {
    state: RwLock<TextState>,
}

impl MemoryFullTextIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn scalar_terms(value: &Value, terms: &mut Vec<String>) {
    match value {
        Value::Null | Value::Id(_) | Value::Instance(_) | Value::Referenceable(_) => {}
        Value::Array(items) => items.iter().for_each(|v| scalar_terms(v, terms)),
        Value::Map(entries) => entries.iter().for_each(|(_, v)| scalar_terms(v, terms)),
        Value::TypedStruct(_) | Value::Struct(_) => {}
        other => terms.extend(tokenize(&other.to_string())),
    }
}

fn struct_terms(value: &Value, terms: &mut Vec<String>) {
    match value {
        Value::TypedStruct(s) => {
            for v in s.values().values() {
                scalar_terms(v, terms);
                struct_terms(v, terms);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| struct_terms(v, terms)),
        Value::Map(entries) => entries.iter().for_each(|(_, v)| struct_terms(v, terms)),
        _ => {}
    }
}

// only single-valued references lend their terms; collections would pull
// in every member of a group
fn references<'a>(value: &'a Value, found: &mut Vec<&'a str>) {
    match value {
        Value::Id(id) => found.push(id.id()),
        Value::TypedStruct(s) => s.values().values().for_each(|v| references(v, found)),
        _ => {}
    }
}

fn trait_terms(name: &str, trait_instance: &TypedStruct) -> Vec<String> {
    let mut terms = tokenize(name);
    for value in trait_instance.values().values() {
        scalar_terms(value, &mut terms);
        struct_terms(value, &mut terms);
    }
    terms
}

impl EntityChangeListener for MemoryFullTextIndex {
    fn on_entity_added(&self, instances: &[TypedInstance]) -> Result<()> {
        let mut state = self.state.write()?;
        for instance in instances {
            let mut own = Vec::new();
            for value in instance.values().values() {
                scalar_terms(value, &mut own);
            }
            state.own.insert(instance.id.id().to_string(), own);
        }
        for instance in instances {
            let guid = instance.id.id().to_string();
            let mut terms = state.own.get(&guid).cloned().unwrap_or_default();
            let mut referenced = Vec::new();
            for value in instance.values().values() {
                struct_terms(value, &mut terms);
                references(value, &mut referenced);
            }
            for target in referenced {
                if let Some(target_terms) = state.own.get(target) {
                    terms.extend(target_terms.iter().cloned());
                }
            }
            let traits = instance
                .traits()
                .iter()
                .map(|(name, t)| (name.clone(), trait_terms(name, t)))
                .collect();
            state.documents.insert(
                guid,
                Document { type_name: instance.type_name().to_string(), terms, traits },
            );
        }
        debug!("Indexed {} documents for full-text search", instances.len());
        Ok(())
    }

    fn on_trait_added(&self, guid: &str, trait_instance: &TypedStruct) -> Result<()> {
        let mut state = self.state.write()?;
        if let Some(document) = state.documents.get_mut(guid) {
            let name = trait_instance.type_name().to_string();
            let terms = trait_terms(&name, trait_instance);
            document.traits.insert(name, terms);
        }
        Ok(())
    }

    fn on_trait_deleted(&self, guid: &str, trait_name: &str) -> Result<()> {
        let mut state = self.state.write()?;
        if let Some(document) = state.documents.get_mut(guid) {
            document.traits.shift_remove(trait_name);
        }
        Ok(())
    }
}

impl FullTextIndex for MemoryFullTextIndex {
    fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.read()?;
        let mut hits: Vec<SearchHit> = state
            .documents
            .iter()
            .filter_map(|(guid, document)| {
                let mut score = 0;
                for term in &terms {
                    match document.occurrences(term) {
                        0 => return None,
                        n => score += n,
                    }
                }
                Some(SearchHit { guid: guid.clone(), type_name: document.type_name.clone(), score })
            })
            .collect();
        hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.guid.cmp(&b.guid)));
        Ok(hits)
    }

    fn document_count(&self) -> Result<usize> {
        Ok(self.state.read()?.documents.len())
    }
}
