//! Persistent key-value storage consumed by the core.
//!
//! Only two pieces of state survive a power cycle: the Check-In
//! counter and the ICD class configuration. Both go through this
//! narrow interface; the platform decides where the bytes actually
//! land (flash, NVS, a file).

use std::collections::HashMap;

use crate::error::Result;

/// Persistent key-value store.
pub trait StateStore {
    /// Load the value stored under `key`, if any
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn store(&mut self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove the value stored under `key`, if any
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// In-memory store for tests and RAM-only deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn store(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
