//! Change notification.
//!
//! Listeners hear about a mutation only once it has been committed, and a
//! failing listener never undoes it. Every failure is logged and handed back
//! to the caller that triggered the notification.

use std::sync::{Arc, RwLock};

use tracing::error;

use crate::datatype::DataType;
use crate::error::{CatalogError, Result};
use crate::instance::{TypedInstance, TypedStruct};

pub trait TypesChangeListener: Send + Sync {
    /// Called once per type of a successfully defined batch.
    fn on_add(&self, type_name: &str, data_type: &DataType) -> Result<()>;
}

pub trait EntityChangeListener: Send + Sync {
    /// Called once per create, with every entity the call created including
    /// cascaded composite children.
    fn on_entity_added(&self, instances: &[TypedInstance]) -> Result<()>;
    fn on_trait_added(&self, guid: &str, trait_instance: &TypedStruct) -> Result<()>;
    fn on_trait_deleted(&self, guid: &str, trait_name: &str) -> Result<()>;
}

pub struct Listeners<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

pub type TypesListeners = Listeners<dyn TypesChangeListener>;
pub type EntityListeners = Listeners<dyn EntityChangeListener>;

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self { listeners: RwLock::new(Vec::new()) }
    }
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers a listener; registering the same one twice is a no-op.
    pub fn register(&self, listener: Arc<L>) -> Result<()> {
        let mut listeners = self.listeners.write()?;
        if !listeners.iter().any(|l| same(l, &listener)) {
            listeners.push(listener);
        }
        Ok(())
    }
    /// Returns whether the listener was registered.
    pub fn unregister(&self, listener: &Arc<L>) -> Result<bool> {
        let mut listeners = self.listeners.write()?;
        let before = listeners.len();
        listeners.retain(|l| !same(l, listener));
        Ok(listeners.len() != before)
    }
    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Runs `call` against every listener, even after one fails, and returns
    /// the failures.
    pub fn notify<F>(&self, event: &str, call: F) -> Vec<CatalogError>
    where
        F: Fn(&L) -> Result<()>,
    {
        // a snapshot, so listeners may (un)register from inside a callback
        let listeners: Vec<Arc<L>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(e) => return vec![CatalogError::from(e)],
        };
        let mut failures = Vec::new();
        for listener in listeners {
            if let Err(e) = call(&listener) {
                error!("Listener failed on {}: {}", event, e);
                failures.push(e);
            }
        }
        failures
    }
}

fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
