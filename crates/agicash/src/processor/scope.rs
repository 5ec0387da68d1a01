//! Per-record task scope

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Bounds concurrency to one in-flight driver per `<kind>-<record id>`
/// key. Cross-record work runs in parallel; two drivers for the same
/// record are funnelled to one.
#[derive(Debug, Default, Clone)]
pub struct TaskScope {
    active: Arc<Mutex<HashSet<String>>>,
}

/// Releases the key on drop
#[derive(Debug)]
pub struct ScopeGuard {
    key: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl TaskScope {
    /// Empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key; `None` when a driver for it is already in flight
    pub fn try_enter(&self, key: impl Into<String>) -> Option<ScopeGuard> {
        let key = key.into();
        let mut active = self.active.lock().ok()?;
        if !active.insert(key.clone()) {
            return None;
        }
        Some(ScopeGuard {
            key,
            active: self.active.clone(),
        })
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}
