//! Service discovery: logical keys mapped to transport addresses.
//!
//! Servers publish `key -> address` entries; clients resolve a key once when a
//! channel opens. `insert` claims a key and fails when it is already taken, so
//! two servers never silently share a name.

mod sqlite;

pub use sqlite::{ServiceEntry, SqliteDiscovery};

use crate::transport::lock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Key-value coordination service.
///
/// All operations report failure as `false`/`None`; an unavailable service
/// looks the same as a missing key.
pub trait Discovery: Send + Sync {
    /// Publish `key -> value`. Fails if the key exists.
    fn insert(&self, key: &str, value: &str) -> bool;

    /// Remove `key`. Fails if it does not exist.
    fn erase(&self, key: &str) -> bool;

    fn get(&self, key: &str) -> Option<String>;
}

/// In-process discovery store.
#[derive(Debug)]
pub struct MemoryDiscovery {
    entries: Mutex<HashMap<String, String>>,
    available: AtomicBool,
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the service going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.entries).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Discovery for MemoryDiscovery {
    fn insert(&self, key: &str, value: &str) -> bool {
        if !self.is_available() {
            debug!("Discovery unavailable, cannot insert {}", key);
            return false;
        }
        let mut entries = lock(&self.entries);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), value.to_string());
        true
    }

    fn erase(&self, key: &str) -> bool {
        if !self.is_available() {
            debug!("Discovery unavailable, cannot erase {}", key);
            return false;
        }
        lock(&self.entries).remove(key).is_some()
    }

    fn get(&self, key: &str) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        lock(&self.entries).get(key).cloned()
    }
}
