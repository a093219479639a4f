// src/objects.rs - Named status objects and their update stream
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 512;

/// A queryable piece of printer state, e.g. `toolhead` or `heater_bed`.
pub trait PrinterObject: Send + Sync {
    fn name(&self) -> String;
    fn query(&self) -> Map<String, Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectUpdate {
    pub name: String,
    pub state: Map<String, Value>,
}

pub struct ObjectRegistry {
    objects: RwLock<BTreeMap<String, Arc<dyn PrinterObject>>>,
    updates: broadcast::Sender<ObjectUpdate>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { objects: RwLock::new(BTreeMap::new()), updates }
    }

    /// Registers an object, replacing any previous one with the same name.
    pub fn register(&self, object: Arc<dyn PrinterObject>) {
        let name = object.name();
        tracing::debug!("Registering object {}", name);
        self.objects.write().unwrap_or_else(PoisonError::into_inner).insert(name, object);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.objects.write().unwrap_or_else(PoisonError::into_inner).remove(name).is_some()
    }

    pub fn clear(&self) {
        self.objects.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<Arc<dyn PrinterObject>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn query(&self, name: &str) -> Option<Map<String, Value>> {
        self.get(name).map(|object| object.query())
    }

    /// Current state of every object, keyed by name.
    pub fn snapshot(&self) -> Map<String, Value> {
        let objects: Vec<_> = self.objects.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        objects
            .into_iter()
            .map(|object| (object.name(), Value::Object(object.query())))
            .collect()
    }

    /// Publishes the current state of one object.
    pub fn emit(&self, name: &str) {
        let Some(object) = self.get(name) else { return };
        let update = ObjectUpdate { name: name.to_string(), state: object.query() };
        // Nobody listening is not an error.
        let _ = self.updates.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObjectUpdate> {
        self.updates.subscribe()
    }
}
