//! Entity identity.
//!
//! An [`Id`] is a *reference* to an entity, never the entity's data. It is
//! created unassigned, carrying a process-unique negative placeholder, and
//! becomes assigned once the repository persists the entity and issues a
//! UUID. Equality is structural over `(id, version, type_name)`.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CatalogError, Result};
use crate::instance::{Instance, Value};

// placeholders count downwards so they can never collide with each other
static NEXT_UNASSIGNED: AtomicI64 = AtomicI64::new(-1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdState {
    Assigned,
    Unassigned,
    /// Neither a placeholder nor a store-issued UUID, e.g. an id typed by hand.
    Invalid,
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Id {
    id: String,
    version: i32,
    type_name: String,
}

impl Id {
    pub fn new(id: impl Into<String>, version: i32, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version,
            type_name: type_name.into(),
        }
    }
    /// A fresh placeholder for an instance that has not been persisted yet.
    pub fn unassigned(type_name: impl Into<String>) -> Self {
        let placeholder = NEXT_UNASSIGNED.fetch_sub(1, Ordering::SeqCst);
        Self::new(placeholder.to_string(), 0, type_name)
    }
    /// A store-issued identity.
    pub fn assign(type_name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), 0, type_name)
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn version(&self) -> i32 {
        self.version
    }
    pub fn type_name(&self) -> &str {
        &self.type_name
    }
    pub fn is_unassigned(&self) -> bool {
        matches!(self.id.parse::<i64>(), Ok(placeholder) if placeholder < 0)
    }
    pub fn is_assigned(&self) -> bool {
        Uuid::parse_str(&self.id).is_ok()
    }
    /// Agrees with [`Id::is_assigned`] and [`Id::is_unassigned`].
    pub fn state(&self) -> IdState {
        if self.is_assigned() {
            IdState::Assigned
        } else if self.is_unassigned() {
            IdState::Unassigned
        } else {
            IdState::Invalid
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_unassigned() {
            write!(f, "(type: {}, id: <unassigned>)", self.type_name)
        } else {
            write!(f, "(type: {}, id: {})", self.type_name, self.id)
        }
    }
}

impl Instance for Id {
    fn type_name(&self) -> &str {
        &self.type_name
    }
    fn get(&self, _attribute: &str) -> Result<&Value> {
        Err(CatalogError::Identity(
            "Get/Set not supported on an Id object".to_string(),
        ))
    }
    fn set(&mut self, _attribute: &str, _value: Value) -> Result<()> {
        Err(CatalogError::Identity(
            "Get/Set not supported on an Id object".to_string(),
        ))
    }
}

/// Wire form: `{id, version, typeName, state}`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdWire {
    id: String,
    #[serde(default)]
    version: i32,
    type_name: String,
    #[serde(default)]
    state: Option<IdState>,
}

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        IdWire {
            id: self.id.clone(),
            version: self.version,
            type_name: self.type_name.clone(),
            state: Some(self.state()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = IdWire::deserialize(deserializer)?;
        Ok(Id::new(wire.id, wire.version, wire.type_name))
    }
}
