//! # The `g` Namespace
//!
//! Per-application-context storage for arbitrary typed values. Each
//! independent application context owns a fresh `Globals`; a request context
//! reusing an outer application context shares it.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe string-keyed value store
///
/// ```ignore
/// ctx.g().set("db", connection);
/// let conn = ctx.g().get::<Connection>("db");
/// ```
#[derive(Clone, Default)]
pub struct Globals {
    data: Arc<RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>>,
}

impl Globals {
    /// Create a new empty namespace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, overwriting any value with the same key
    pub fn set<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.data.write().insert(key.into(), Box::new(value));
    }

    /// Get a cloned value by key
    ///
    /// Returns `None` if key doesn't exist or type doesn't match.
    #[must_use]
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.data
            .read()
            .get(key)
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// Get a value or store the one produced by `init`
    pub fn get_or_insert_with<T, F>(&self, key: &str, init: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get::<T>(key) {
            return value;
        }
        let value = init();
        self.set(key, value.clone());
        value
    }

    /// Check if a key exists
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Remove a value by key
    pub fn remove(&self, key: &str) -> bool {
        self.data.write().remove(key).is_some()
    }

    /// Stored keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Get the number of stored items
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if namespace is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries holding JSON values, strings, integers or booleans
    ///
    /// Other types are skipped.
    #[must_use]
    pub fn to_json(&self) -> Map<String, Value> {
        let data = self.data.read();
        let mut map = Map::new();
        for (key, boxed) in data.iter() {
            let value = if let Some(v) = boxed.downcast_ref::<Value>() {
                v.clone()
            } else if let Some(s) = boxed.downcast_ref::<String>() {
                Value::String(s.clone())
            } else if let Some(s) = boxed.downcast_ref::<&'static str>() {
                Value::String((*s).to_string())
            } else if let Some(i) = boxed.downcast_ref::<i64>() {
                Value::from(*i)
            } else if let Some(b) = boxed.downcast_ref::<bool>() {
                Value::Bool(*b)
            } else {
                continue;
            };
            map.insert(key.clone(), value);
        }
        map
    }

    /// Whether two handles point at the same namespace
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl std::fmt::Debug for Globals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Globals").field("keys", &self.keys()).finish()
    }
}
