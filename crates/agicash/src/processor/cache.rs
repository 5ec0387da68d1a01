//! Version-guarded record cache

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

/// In-memory cache of records keyed by id, for UI reads.
///
/// An entry is only replaced when the incoming version is strictly
/// newer, so an optimistic local write is never clobbered by a stale
/// load racing it. Change notifications invalidate by id.
#[derive(Debug)]
pub struct VersionedCache<T: Clone> {
    entries: RwLock<HashMap<Uuid, (u32, T)>>,
}

impl<T: Clone> Default for VersionedCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> VersionedCache<T> {
    /// Empty cache
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached value for an id
    pub fn get(&self, id: Uuid) -> Option<T> {
        self.entries
            .read()
            .ok()?
            .get(&id)
            .map(|(_, value)| value.clone())
    }

    /// Insert or replace; returns whether the value was accepted.
    ///
    /// Rejected when an entry with the same or a newer version is
    /// already cached.
    pub fn put(&self, id: Uuid, version: u32, value: T) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        match entries.get(&id) {
            Some((cached_version, _)) if *cached_version >= version => false,
            _ => {
                entries.insert(id, (version, value));
                true
            }
        }
    }

    /// Drop the entry for an id
    pub fn invalidate(&self, id: Uuid) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&id);
        }
    }
}
