//! Raw traversal search: a gremlin-style pipeline evaluated straight
//! against the graph store, bypassing the type system.

use std::collections::BTreeMap;

use pest::Parser;
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest_derive::Parser;
use tracing::debug;

use crate::error::{CatalogError, Result};
use crate::graph::{Direction, GraphStore, PropertyValue, VertexId};

#[derive(Parser)]
#[grammar = "gremlin.pest"]
struct GremlinParser;

pub const VERTEX_ID_KEY: &str = "id";
pub const VALUE_KEY: &str = "value";

#[derive(Debug, Clone, PartialEq)]
pub enum Pipe {
    Has { key: String, value: Option<PropertyValue> },
    Walk { direction: Direction, label: Option<String> },
    Values(String),
    Limit(usize),
}

pub fn parse(text: &str) -> Result<Vec<Pipe>> {
    let mut pairs = GremlinParser::parse(Rule::traversal, text).map_err(|e| {
        let (line, col) = match e.line_col {
            LineColLocation::Pos(at) | LineColLocation::Span(at, _) => at,
        };
        CatalogError::QueryParse {
            message: format!("{} at line {}, column {}", e.variant.message(), line, col),
            line: Some(line),
            col: Some(col),
        }
    })?;
    let mut pipes = Vec::new();
    let Some(traversal) = pairs.next() else {
        return Ok(pipes);
    };
    for step in traversal.into_inner().filter(|p| p.as_rule() == Rule::step) {
        let Some(inner) = step.into_inner().next() else {
            continue;
        };
        let rule = inner.as_rule();
        let mut args = inner.into_inner();
        let pipe = match rule {
            Rule::has | Rule::filter => {
                let key = args.next().map(key_text).unwrap_or_default();
                Pipe::Has { key, value: args.next().map(literal) }
            }
            Rule::out => Pipe::Walk { direction: Direction::Out, label: args.next().map(key_text) },
            Rule::into => Pipe::Walk { direction: Direction::In, label: args.next().map(key_text) },
            Rule::values => Pipe::Values(args.next().map(key_text).unwrap_or_default()),
            Rule::limit => {
                let count = args.next().map(|p| p.as_str()).unwrap_or("0");
                Pipe::Limit(
                    count
                        .parse()
                        .map_err(|_| CatalogError::InvalidQuery(format!("bad limit {}", count)))?,
                )
            }
            _ => continue,
        };
        pipes.push(pipe);
    }
    Ok(pipes)
}

// the text of a string (quotes stripped) or a dotted key
fn key_text(pair: Pair<Rule>) -> String {
    match pair.as_rule() {
        Rule::key => pair.into_inner().next().map(key_text).unwrap_or_default(),
        Rule::string => pair.into_inner().next().map(|p| p.as_str().to_string()).unwrap_or_default(),
        _ => pair.as_str().to_string(),
    }
}

fn literal(pair: Pair<Rule>) -> PropertyValue {
    let Some(inner) = pair.into_inner().next() else {
        return PropertyValue::String(String::new());
    };
    let text = inner.as_str();
    match inner.as_rule() {
        Rule::number => match text.parse::<i64>() {
            Ok(v) => PropertyValue::Long(v),
            Err(_) => text.parse::<f64>().map(PropertyValue::Double).unwrap_or(PropertyValue::String(text.to_string())),
        },
        Rule::boolean => PropertyValue::Bool(text == "true"),
        _ => PropertyValue::String(key_text(inner)),
    }
}

enum Stream {
    Vertices(Vec<VertexId>),
    Values(Vec<PropertyValue>),
}

/// Evaluates a traversal. Vertex results carry every property as text plus
/// the vertex id; value results are `{value: ..}`.
pub fn search(graph: &dyn GraphStore, text: &str) -> Result<Vec<BTreeMap<String, String>>> {
    let pipes = parse(text)?;
    let mut stream = Stream::Vertices(graph.vertex_ids()?);
    for pipe in &pipes {
        stream = match (stream, pipe) {
            (Stream::Vertices(ids), Pipe::Has { key, value }) => {
                let mut kept = Vec::new();
                for id in ids {
                    let Some(vertex) = graph.vertex(id)? else {
                        continue;
                    };
                    let keep = match (vertex.property(key), value) {
                        (Some(found), Some(wanted)) => found.matches(wanted),
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if keep {
                        kept.push(id);
                    }
                }
                Stream::Vertices(kept)
            }
            (Stream::Vertices(ids), Pipe::Walk { direction, label }) => {
                let mut reached = Vec::new();
                for id in ids {
                    for edge in graph.edges(id, *direction, label.as_deref())? {
                        reached.push(edge.other(id));
                    }
                }
                Stream::Vertices(reached)
            }
            (Stream::Vertices(ids), Pipe::Values(key)) => {
                let mut values = Vec::new();
                for id in ids {
                    if let Some(value) = graph.vertex(id)?.and_then(|v| v.property(key).cloned()) {
                        values.push(value);
                    }
                }
                Stream::Values(values)
            }
            (Stream::Vertices(mut ids), Pipe::Limit(n)) => {
                ids.truncate(*n);
                Stream::Vertices(ids)
            }
            (Stream::Values(mut values), Pipe::Limit(n)) => {
                values.truncate(*n);
                Stream::Values(values)
            }
            (Stream::Values(_), other) => {
                return Err(CatalogError::InvalidQuery(format!("{:?} cannot follow a values step", other)));
            }
        };
    }
    let rows = match stream {
        Stream::Vertices(ids) => {
            let mut rows = Vec::new();
            for id in ids {
                if let Some(vertex) = graph.vertex(id)? {
                    let mut row: BTreeMap<String, String> =
                        vertex.properties.iter().map(|(k, v)| (k.clone(), v.to_string())).collect();
                    row.insert(VERTEX_ID_KEY.to_string(), id.to_string());
                    rows.push(row);
                }
            }
            rows
        }
        Stream::Values(values) => values
            .into_iter()
            .map(|v| BTreeMap::from([(VALUE_KEY.to_string(), v.to_string())]))
            .collect(),
    };
    debug!("Traversal '{}' returned {} rows", text, rows.len());
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_pipeline() {
        let pipes = parse("g.V.has('typeName', 'Person').filter{it.'Person.name' == 'John'}.out('Person.department').'Department.name'.limit(1).toList()")
            .expect("parses");
        assert_eq!(pipes.len(), 5);
        assert_eq!(
            pipes[0],
            Pipe::Has { key: "typeName".into(), value: Some(PropertyValue::String("Person".into())) }
        );
        assert_eq!(pipes[3], Pipe::Values("Department.name".into()));
        assert_eq!(pipes[4], Pipe::Limit(1));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse("g.E"), Err(CatalogError::QueryParse { .. })));
    }
}
