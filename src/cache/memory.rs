//! In-memory cache regions
//!
//! Regions backed by Moka caches. Nothing survives a restart, so the
//! persisted manifest is lost too and every start is a first install.
//! Entries never expire; only explicit deletes remove them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use moka::sync::Cache;
use tracing::{debug, trace};

use super::storage::{CacheRegion, CacheStorage};
use crate::origin::OriginResponse;

/// Memory-backed storage
pub struct MemoryStorage {
    /// Open regions by name
    regions: RwLock<HashMap<String, Arc<MemoryRegion>>>,
}

impl MemoryStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStorage for MemoryStorage {
    fn open(&self, name: &str) -> Result<Arc<dyn CacheRegion>> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        let region = regions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryRegion::new(name)));
        Ok(Arc::clone(region) as Arc<dyn CacheRegion>)
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let removed = self
            .regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            debug!(region = name, "Deleted memory region");
        }
        Ok(removed)
    }

    fn has(&self, name: &str) -> Result<bool> {
        Ok(self
            .regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name))
    }
}

/// A single memory region
pub struct MemoryRegion {
    /// Stored responses by key
    entries: Cache<String, OriginResponse>,
}

impl MemoryRegion {
    fn new(name: &str) -> Self {
        Self {
            entries: Cache::builder().name(name).build(),
        }
    }
}

impl CacheRegion for MemoryRegion {
    fn get(&self, key: &str) -> Result<Option<OriginResponse>> {
        match self.entries.get(key) {
            Some(response) => {
                trace!(key = key, "Memory region HIT");
                Ok(Some(response))
            }
            None => {
                trace!(key = key, "Memory region MISS");
                Ok(None)
            }
        }
    }

    fn put(&self, key: &str, response: &OriginResponse) -> Result<()> {
        self.entries.insert(key.to_string(), response.clone());
        debug!(key = key, size = response.body.len(), "Stored memory entry");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.iter().map(|(k, _)| (*k).clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_put_get() {
        let region = MemoryRegion::new("live");

        assert!(region.get("a.js").unwrap().is_none());
        region.put("a.js", &OriginResponse::new(200, "a")).unwrap();
        assert_eq!(&region.get("a.js").unwrap().unwrap().body[..], b"a");
    }

    #[test]
    fn test_keys_and_delete() {
        let storage = MemoryStorage::new();
        let region = storage.open("live").unwrap();
        region.put("b", &OriginResponse::new(200, "b")).unwrap();
        region.put("a", &OriginResponse::new(200, "a")).unwrap();

        assert_eq!(region.keys().unwrap(), vec!["a", "b"]);
        assert!(region.delete("a").unwrap());
        assert!(!region.delete("a").unwrap());
        assert_eq!(region.keys().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_open_returns_same_region() {
        let storage = MemoryStorage::new();
        storage
            .open("live")
            .unwrap()
            .put("x", &OriginResponse::new(200, "x"))
            .unwrap();

        let again = storage.open("live").unwrap();
        assert!(again.get("x").unwrap().is_some());
    }

    #[test]
    fn test_delete_region() {
        let storage = MemoryStorage::new();
        storage
            .open("temp")
            .unwrap()
            .put("x", &OriginResponse::new(200, "x"))
            .unwrap();

        assert!(storage.has("temp").unwrap());
        assert!(storage.delete("temp").unwrap());
        assert!(!storage.has("temp").unwrap());
        assert!(storage.open("temp").unwrap().keys().unwrap().is_empty());
    }
}
