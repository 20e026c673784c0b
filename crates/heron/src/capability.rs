//! Model capability cache.
//!
//! Whether a `(model, base_url)` pair supports native tool calling is
//! learned at runtime (a tools-bearing request gets rejected) and does not
//! change while the process lives. Entries are write-once: the first
//! insert wins and later inserts are ignored, so readers need no locking
//! discipline beyond the map mutex. The cache is owned by whoever creates
//! the agent and injected, never ambient.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct CapabilityCache {
    native_tools: Mutex<HashMap<(String, String), bool>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether native tool calling is known to work for this model/host.
    /// `None` means not yet learned.
    pub fn native_tools(&self, model: &str, base_url: &str) -> Option<bool> {
        self.native_tools
            .lock()
            .unwrap()
            .get(&(model.to_string(), base_url.to_string()))
            .copied()
    }

    /// Record the capability. Write-once per key: the first recorded value
    /// sticks.
    pub fn record_native_tools(&self, model: &str, base_url: &str, supported: bool) {
        self.native_tools
            .lock()
            .unwrap()
            .entry((model.to_string(), base_url.to_string()))
            .or_insert(supported);
    }

    pub fn clear(&self) {
        self.native_tools.lock().unwrap().clear();
    }
}
