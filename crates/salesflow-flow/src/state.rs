use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use salesflow_core::error::{Result, SalesflowError};

/// Shared scratchpad for one flow run.
///
/// Keys are strings; values are JSON. Cloning yields another handle to the
/// same map, so every step of a run sees the same data. Writes are
/// last-write-wins with no key-level locking: concurrent fan-out items must
/// not target the same key.
#[derive(Clone, Default)]
pub struct StateStore {
    data: Arc<RwLock<HashMap<String, Value>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with initial data.
    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Get a value by key. Missing keys are an error; nothing is
    /// default-initialized.
    pub fn get(&self, key: &str) -> Result<Value> {
        self.read()
            .get(key)
            .cloned()
            .ok_or_else(|| SalesflowError::KeyNotFound(key.to_string()))
    }

    /// Get a value and deserialize it.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.get(key)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Set a value, overwriting unconditionally.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.write().insert(key.into(), value);
    }

    /// Serialize and set a value.
    pub fn set_as<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Point-in-time copy of the whole store.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A poisoned lock only means a handler panicked mid-write; the map itself
    // is still a valid HashMap.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Value>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let store = StateStore::new();
        store.set("name", json!("Alice"));
        store.set("count", json!(42));

        assert_eq!(store.get("name").unwrap(), json!("Alice"));
        assert_eq!(store.get_as::<u32>("count").unwrap(), 42);
        assert!(store.contains("count"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let store = StateStore::new();
        let err = store.get("score_crews_results").unwrap_err();
        assert!(matches!(err, SalesflowError::KeyNotFound(k) if k == "score_crews_results"));
    }

    #[test]
    fn test_last_write_wins() {
        let store = StateStore::new();
        store.set("k", json!(1));
        store.set("k", json!(2));
        assert_eq!(store.get("k").unwrap(), json!(2));
    }

    #[test]
    fn test_clones_share_data() {
        let store = StateStore::new();
        let handle = store.clone();
        handle.set("shared", json!(true));
        assert_eq!(store.get("shared").unwrap(), json!(true));
    }

    #[test]
    fn test_separate_stores_are_isolated() {
        let a = StateStore::new();
        let b = StateStore::new();
        a.set("k", json!(1));
        assert!(!b.contains("k"));
    }

    #[test]
    fn test_keys_sorted_and_snapshot() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), json!(2));
        map.insert("a".to_string(), json!(1));
        let store = StateStore::from_map(map);
        assert_eq!(store.keys(), vec!["a", "b"]);

        let snap = store.snapshot();
        store.set("c", json!(3));
        assert_eq!(snap.len(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_set_as_round_trips_struct() {
        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Tally {
            scored: usize,
        }
        let store = StateStore::new();
        store.set_as("tally", &Tally { scored: 3 }).unwrap();
        assert_eq!(store.get_as::<Tally>("tally").unwrap(), Tally { scored: 3 });
        assert!(store.get_as::<String>("tally").is_err());
    }
}
