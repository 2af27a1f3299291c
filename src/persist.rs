//! SQLite persistence for the graph and for type definitions.
//!
//! One connection is shared by the [`SqliteGraph`] and the
//! [`SqliteTypeStore`]. Property values are stored as JSON text so that every
//! [`PropertyValue`] survives the round trip unchanged.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info};

use crate::datatype::TypesDef;
use crate::error::{CatalogError, Result};
use crate::graph::{
    Direction, Edge, EdgeId, GraphBatch, GraphOp, GraphStore, Properties, PropertyValue, Vertex,
    VertexId, VertexRef,
};

pub type SharedConnection = Arc<Mutex<Connection>>;

/// Opens (or creates) a database file and prepares the catalog tables.
pub fn open_connection(path: &Path) -> Result<SharedConnection> {
    let connection = Connection::open(path)?;
    info!("Opened catalog database at {}", path.display());
    prepare(connection)
}

pub fn in_memory_connection() -> Result<SharedConnection> {
    prepare(Connection::open_in_memory()?)
}

fn prepare(connection: Connection) -> Result<SharedConnection> {
    connection.execute_batch(
        "
        create table if not exists Vertex (
            Vertex_Identity integer primary key autoincrement
        );
        create table if not exists VertexProperty (
            Vertex_Identity integer not null,
            PropertyKey text not null,
            PropertyValue text not null,
            constraint VertexProperty_of_Vertex foreign key (
                Vertex_Identity
            ) references Vertex(Vertex_Identity),
            constraint unique_VertexProperty primary key (
                Vertex_Identity,
                PropertyKey
            )
        );
        create index if not exists VertexProperty_by_value on VertexProperty (
            PropertyKey,
            PropertyValue
        );
        create table if not exists Edge (
            Edge_Identity integer primary key autoincrement,
            Label text not null,
            OutVertex_Identity integer not null,
            InVertex_Identity integer not null,
            Properties text not null,
            constraint OutVertex_is_Vertex foreign key (
                OutVertex_Identity
            ) references Vertex(Vertex_Identity),
            constraint InVertex_is_Vertex foreign key (
                InVertex_Identity
            ) references Vertex(Vertex_Identity)
        );
        create index if not exists Edge_by_out on Edge (OutVertex_Identity, Label);
        create index if not exists Edge_by_in on Edge (InVertex_Identity, Label);
        create table if not exists PropertyIndex (
            PropertyKey text not null,
            constraint unique_PropertyIndex primary key (
                PropertyKey
            )
        );
        create table if not exists TypeBatch (
            TypeBatch_Identity integer primary key autoincrement,
            Definition text not null
        );
        ",
    )?;
    Ok(Arc::new(Mutex::new(connection)))
}

fn encode(value: &PropertyValue) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode(text: &str) -> Result<PropertyValue> {
    serde_json::from_str(text).map_err(|e| CatalogError::Persistence(format!("corrupt property value '{}': {}", text, e)))
}

// ------------- Graph -------------
pub struct SqliteGraph {
    connection: SharedConnection,
}
impl SqliteGraph {
    pub fn new(connection: SharedConnection) -> Self {
        Self { connection }
    }
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(in_memory_connection()?))
    }

    fn resolve(tx: &Transaction, vertex: VertexRef, created: &[VertexId]) -> Result<VertexId> {
        match vertex {
            VertexRef::New(i) => created
                .get(i)
                .copied()
                .ok_or_else(|| CatalogError::Repository(format!("batch refers to unknown vertex {:?}", vertex))),
            VertexRef::Existing(id) => {
                let exists: Option<i64> = tx
                    .query_row("select Vertex_Identity from Vertex where Vertex_Identity = ?", [id as i64], |row| {
                        row.get(0)
                    })
                    .optional()?;
                exists
                    .map(|_| id)
                    .ok_or_else(|| CatalogError::Repository(format!("batch refers to unknown vertex {}", id)))
            }
        }
    }

    fn apply_op(tx: &Transaction, op: GraphOp, created: &mut Vec<VertexId>) -> Result<()> {
        match op {
            GraphOp::AddVertex(properties) => {
                tx.execute("insert into Vertex (Vertex_Identity) values (null)", [])?;
                let id = tx.last_insert_rowid() as VertexId;
                for (key, value) in properties {
                    tx.execute(
                        "insert into VertexProperty (Vertex_Identity, PropertyKey, PropertyValue) values (?, ?, ?)",
                        params![id as i64, key, encode(&value)?],
                    )?;
                }
                created.push(id);
            }
            GraphOp::SetProperty { vertex, key, value } => {
                let id = Self::resolve(tx, vertex, created)?;
                tx.execute(
                    "insert or replace into VertexProperty (Vertex_Identity, PropertyKey, PropertyValue) values (?, ?, ?)",
                    params![id as i64, key, encode(&value)?],
                )?;
            }
            GraphOp::RemoveProperty { vertex, key } => {
                let id = Self::resolve(tx, vertex, created)?;
                tx.execute(
                    "delete from VertexProperty where Vertex_Identity = ? and PropertyKey = ?",
                    params![id as i64, key],
                )?;
            }
            GraphOp::AddEdge { label, out_vertex, in_vertex, properties } => {
                let out_id = Self::resolve(tx, out_vertex, created)?;
                let in_id = Self::resolve(tx, in_vertex, created)?;
                tx.execute(
                    "insert into Edge (Label, OutVertex_Identity, InVertex_Identity, Properties) values (?, ?, ?, ?)",
                    params![label, out_id as i64, in_id as i64, serde_json::to_string(&properties)?],
                )?;
            }
            GraphOp::RemoveEdge(edge) => {
                let removed = tx.execute("delete from Edge where Edge_Identity = ?", [edge as i64])?;
                if removed == 0 {
                    return Err(CatalogError::Repository(format!("batch removes unknown edge {}", edge)));
                }
            }
            GraphOp::RemoveVertex(vertex) => {
                Self::resolve(tx, VertexRef::Existing(vertex), created)?;
                let id = vertex as i64;
                tx.execute("delete from Edge where OutVertex_Identity = ? or InVertex_Identity = ?", [id, id])?;
                tx.execute("delete from VertexProperty where Vertex_Identity = ?", [id])?;
                tx.execute("delete from Vertex where Vertex_Identity = ?", [id])?;
            }
        }
        Ok(())
    }
}

fn edge_from_row(row: &rusqlite::Row) -> rusqlite::Result<(EdgeId, String, VertexId, VertexId, String)> {
    Ok((
        row.get::<_, i64>(0)? as EdgeId,
        row.get(1)?,
        row.get::<_, i64>(2)? as VertexId,
        row.get::<_, i64>(3)? as VertexId,
        row.get(4)?,
    ))
}

impl GraphStore for SqliteGraph {
    fn apply(&self, batch: GraphBatch) -> Result<Vec<VertexId>> {
        let mut connection = self.connection.lock()?;
        let tx = connection.transaction()?;
        let mut created = Vec::new();
        for op in batch.ops().iter().cloned() {
            // dropping the transaction on error rolls it back
            Self::apply_op(&tx, op, &mut created)?;
        }
        tx.commit()?;
        Ok(created)
    }

    fn vertex(&self, id: VertexId) -> Result<Option<Vertex>> {
        let connection = self.connection.lock()?;
        let exists: Option<i64> = connection
            .query_row("select Vertex_Identity from Vertex where Vertex_Identity = ?", [id as i64], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }
        let mut statement = connection
            .prepare_cached("select PropertyKey, PropertyValue from VertexProperty where Vertex_Identity = ?")?;
        let rows = statement.query_map([id as i64], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut properties = Properties::new();
        for row in rows {
            let (key, value) = row?;
            properties.insert(key, decode(&value)?);
        }
        Ok(Some(Vertex { id, properties }))
    }

    fn vertex_ids(&self) -> Result<Vec<VertexId>> {
        let connection = self.connection.lock()?;
        let mut statement = connection.prepare_cached("select Vertex_Identity from Vertex order by Vertex_Identity")?;
        let ids = statement
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(|id| id as VertexId))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn vertices_where(&self, key: &str, value: &PropertyValue) -> Result<Vec<VertexId>> {
        let connection = self.connection.lock()?;
        // list values are decoded and checked for containment
        let mut statement = connection.prepare_cached(
            "
            select Vertex_Identity, PropertyValue
                from VertexProperty
                where PropertyKey = ?
                and (PropertyValue = ? or PropertyValue like '[%')
                order by Vertex_Identity
            ",
        )?;
        let rows = statement.query_map(params![key, encode(value)?], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut ids = Vec::new();
        for row in rows {
            let (id, stored) = row?;
            if decode(&stored)?.matches(value) {
                ids.push(id as VertexId);
            }
        }
        Ok(ids)
    }

    fn edges(&self, vertex: VertexId, direction: Direction, label: Option<&str>) -> Result<Vec<Edge>> {
        let connection = self.connection.lock()?;
        let condition = match direction {
            Direction::Out => "OutVertex_Identity = ?1",
            Direction::In => "InVertex_Identity = ?1",
            Direction::Both => "(OutVertex_Identity = ?1 or InVertex_Identity = ?1)",
        };
        let sql = format!(
            "select Edge_Identity, Label, OutVertex_Identity, InVertex_Identity, Properties from Edge where {} and (?2 is null or Label = ?2) order by Edge_Identity",
            condition
        );
        let mut statement = connection.prepare_cached(&sql)?;
        let rows = statement.query_map(params![vertex as i64, label], edge_from_row)?;
        let mut edges = Vec::new();
        for row in rows {
            let (id, label, out_vertex, in_vertex, properties) = row?;
            let properties: Properties = serde_json::from_str(&properties)
                .map_err(|e| CatalogError::Persistence(format!("corrupt properties of edge {}: {}", id, e)))?;
            edges.push(Edge { id, label, out_vertex, in_vertex, properties });
        }
        Ok(edges)
    }

    fn create_index(&self, key: &str) -> Result<()> {
        // values are covered by VertexProperty_by_value; only the key is recorded
        let connection = self.connection.lock()?;
        let added = connection.execute("insert or ignore into PropertyIndex (PropertyKey) values (?)", [key])?;
        if added > 0 {
            debug!("Created property index on '{}'", key);
        }
        Ok(())
    }

    fn indexed_keys(&self) -> Result<Vec<String>> {
        let connection = self.connection.lock()?;
        let mut statement = connection.prepare_cached("select PropertyKey from PropertyIndex order by PropertyKey")?;
        let keys = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn vertex_count(&self) -> Result<usize> {
        let connection = self.connection.lock()?;
        let count: i64 = connection.query_row("select count(*) from Vertex", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ------------- Type definitions -------------
/// Durable storage for type batches, replayed when a catalog is opened.
pub trait TypeStore: Send + Sync {
    fn store(&self, defs: &TypesDef) -> Result<()>;
    /// Every stored batch merged into one, in storage order.
    fn restore(&self) -> Result<TypesDef>;
}

#[derive(Debug, Default)]
pub struct MemoryTypeStore {
    batches: Mutex<Vec<TypesDef>>,
}
impl MemoryTypeStore {
    pub fn new() -> Self {
        Self::default()
    }
}
impl TypeStore for MemoryTypeStore {
    fn store(&self, defs: &TypesDef) -> Result<()> {
        self.batches.lock()?.push(defs.clone());
        Ok(())
    }
    fn restore(&self) -> Result<TypesDef> {
        let mut merged = TypesDef::default();
        for batch in self.batches.lock()?.iter() {
            merged.extend(batch.clone());
        }
        Ok(merged)
    }
}

pub struct SqliteTypeStore {
    connection: SharedConnection,
}
impl SqliteTypeStore {
    pub fn new(connection: SharedConnection) -> Self {
        Self { connection }
    }
}
impl TypeStore for SqliteTypeStore {
    fn store(&self, defs: &TypesDef) -> Result<()> {
        let connection = self.connection.lock()?;
        connection.execute("insert into TypeBatch (Definition) values (?)", [defs.to_json()?])?;
        Ok(())
    }
    fn restore(&self) -> Result<TypesDef> {
        let connection = self.connection.lock()?;
        let mut statement = connection.prepare("select Definition from TypeBatch order by TypeBatch_Identity")?;
        let definitions = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut merged = TypesDef::default();
        for definition in definitions {
            merged.extend(TypesDef::from_json(&definition)?);
        }
        Ok(merged)
    }
}
