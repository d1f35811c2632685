//! State storage for stateful handlers
//!
//! Handlers like `integrate()` and `moving_avg()` need to persist state
//! between evaluation cycles (last timestamp, window values, etc.). Group
//! evaluation is synchronous, so the store is too.

use crate::error::{FormulaError, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State storage trait for stateful handlers
///
/// Implementations can wrap Redis, in-memory storage, or other backends.
pub trait StateStore: Send + Sync {
    /// Get state for a key
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set state for a key
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete state for a key
    fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`, returning how many went away
    fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// In-memory state store for testing and simple use cases
#[derive(Default)]
pub struct MemoryStateStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|key, _| !key.starts_with(prefix));
        Ok(before - data.len())
    }
}

/// Null state store - nothing persists, stateful handlers restart every cycle
pub struct NullStateStore;

impl StateStore for NullStateStore {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn delete_prefix(&self, _prefix: &str) -> Result<usize> {
        Ok(0)
    }
}

/// Load and decode a JSON state entry
pub fn load_state<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| FormulaError::state(format!("Failed to deserialize state: {}", e))),
        None => Ok(None),
    }
}

/// Encode and store a JSON state entry
pub fn save_state<T: Serialize>(store: &dyn StateStore, key: &str, state: &T) -> Result<()> {
    let data = serde_json::to_vec(state)
        .map_err(|e| FormulaError::state(format!("Failed to serialize state: {}", e)))?;
    store.set(key, &data)
}

// === State data structures for built-in handlers ===

/// Integrate handler state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrateState {
    /// Last timestamp (Unix seconds, f64 for precision)
    pub last_ts: f64,
    /// Accumulated value
    pub accumulated: f64,
}

/// Moving average handler state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovingAvgState {
    /// Circular buffer of recent values
    pub values: Vec<f64>,
    /// Next write position in buffer
    pub position: usize,
    /// Number of values stored (may be less than buffer size initially)
    pub count: usize,
}

impl MovingAvgState {
    pub fn new(window_size: usize) -> Self {
        Self {
            values: vec![0.0; window_size.max(1)],
            position: 0,
            count: 0,
        }
    }

    pub fn window(&self) -> usize {
        self.values.len()
    }

    /// Add a value and return the new moving average
    pub fn add(&mut self, value: f64) -> f64 {
        self.values[self.position] = value;
        self.position = (self.position + 1) % self.values.len();
        if self.count < self.values.len() {
            self.count += 1;
        }
        self.average()
    }

    /// Get current average
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let sum: f64 = self.values.iter().take(self.count).sum();
        sum / self.count as f64
    }
}

/// Rate of change handler state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateOfChangeState {
    /// Last timestamp (Unix seconds)
    pub last_ts: f64,
    /// Last value
    pub last_value: f64,
}

/// Key of one handler state entry
///
/// Format: `formula:state:{group}:{func}:{var}`
pub fn state_key(group: &str, func: &str, var: &str) -> String {
    format!("{}{}:{}", group_prefix(group), func, var)
}

/// Prefix shared by every state entry of a group
pub fn group_prefix(group: &str) -> String {
    format!("formula:state:{}:", group)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_moving_avg_state() {
        let mut state = MovingAvgState::new(3);
        assert_eq!(state.add(10.0), 10.0); // [10], avg=10
        assert_eq!(state.add(20.0), 15.0); // [10,20], avg=15
        assert_eq!(state.add(30.0), 20.0); // [10,20,30], avg=20
        assert_eq!(state.add(40.0), 30.0); // [40,20,30], avg=30 (overwrites 10)
    }

    #[test]
    fn test_state_roundtrip_and_prefix_delete() {
        let store = MemoryStateStore::new();
        let state = RateOfChangeState {
            last_ts: 10.0,
            last_value: 5.0,
        };
        save_state(&store, &state_key("g1", "rate", "v"), &state).unwrap();
        save_state(&store, &state_key("g2", "rate", "v"), &state).unwrap();

        let loaded: RateOfChangeState = load_state(&store, &state_key("g1", "rate", "v"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_value, 5.0);

        assert_eq!(store.delete_prefix(&group_prefix("g1")).unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_corrupt_state_is_a_state_error() {
        let store = MemoryStateStore::new();
        store.set("k", b"not json").unwrap();
        let result: Result<Option<IntegrateState>> = load_state(&store, "k");
        assert!(matches!(result, Err(FormulaError::State(_))));
    }
}
