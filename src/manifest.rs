//! Resource manifest and its persisted record
//!
//! The manifest maps logical request paths to content fingerprints and is
//! produced by the build. The last manifest fully reconciled into the live
//! region is kept in its own cache region so the next activation can diff
//! against it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheRegion, CacheStorage, MANIFEST_REGION};
use crate::origin::OriginResponse;

/// Key of the manifest entry inside the manifest region
pub const MANIFEST_KEY: &str = "manifest";

/// Logical key of the root document
pub const ROOT_KEY: &str = "/";

/// Mapping from logical path to content fingerprint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceManifest {
    resources: BTreeMap<String, String>,
}

impl ResourceManifest {
    /// Parse a manifest from its JSON form (`{"path": "fingerprint", ...}`)
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Manifest must be a JSON object of string values")
    }

    /// Load a manifest file produced by the build
    pub fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("Invalid manifest: {}", path.display()))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize manifest")
    }

    /// Fingerprint for a path, if listed
    pub fn fingerprint(&self, path: &str) -> Option<&str> {
        self.resources.get(path).map(String::as_str)
    }

    /// Whether a path is listed
    pub fn contains(&self, path: &str) -> bool {
        self.resources.contains_key(path)
    }

    /// All listed paths in sorted order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResourceManifest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            resources: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Read/write access to the persisted manifest record
pub struct ManifestStore {
    region: Arc<dyn CacheRegion>,
}

impl ManifestStore {
    /// Open the manifest region of a storage
    pub fn open(storage: &dyn CacheStorage) -> Result<Self> {
        let region = storage
            .open(MANIFEST_REGION)
            .context("Failed to open manifest region")?;
        Ok(Self { region })
    }

    /// Load the last committed manifest
    ///
    /// Returns None if nothing was ever committed. A record that exists but
    /// cannot be decoded is an error.
    pub fn load(&self) -> Result<Option<ResourceManifest>> {
        match self.region.get(MANIFEST_KEY)? {
            Some(record) => {
                let manifest = ResourceManifest::from_json(&record.body)
                    .context("Persisted manifest record is corrupt")?;
                debug!(entries = manifest.len(), "Loaded persisted manifest");
                Ok(Some(manifest))
            }
            None => Ok(None),
        }
    }

    /// Replace the persisted record with the given manifest
    pub fn commit(&self, manifest: &ResourceManifest) -> Result<()> {
        let record = OriginResponse::new(200, manifest.to_json()?)
            .with_header("content-type", "application/json");
        self.region
            .put(MANIFEST_KEY, &record)
            .context("Failed to commit manifest")?;
        debug!(entries = manifest.len(), "Committed manifest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;

    #[test]
    fn test_parse_manifest() {
        let json = br#"{"main.dart.js":"8d49","/":"2d35","index.html":"2d35"}"#;
        let manifest = ResourceManifest::from_json(json).unwrap();

        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.fingerprint("main.dart.js"), Some("8d49"));
        assert!(manifest.contains(ROOT_KEY));
        assert!(!manifest.contains("favicon.png"));
        assert_eq!(
            manifest.paths().collect::<Vec<_>>(),
            vec!["/", "index.html", "main.dart.js"]
        );
    }

    #[test]
    fn test_parse_rejects_non_string_values() {
        assert!(ResourceManifest::from_json(br#"{"a": 1}"#).is_err());
        assert!(ResourceManifest::from_json(br#"["a"]"#).is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, br#"{"flutter.js":"a85f"}"#).unwrap();

        let manifest = ResourceManifest::load_file(&path).unwrap();
        assert_eq!(manifest.fingerprint("flutter.js"), Some("a85f"));
        assert!(ResourceManifest::load_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_store_load_absent_then_commit() {
        let storage = MemoryStorage::new();
        let store = ManifestStore::open(&storage).unwrap();
        assert!(store.load().unwrap().is_none());

        let manifest: ResourceManifest = [("a", "1"), ("b", "2")].into_iter().collect();
        store.commit(&manifest).unwrap();
        assert_eq!(store.load().unwrap(), Some(manifest.clone()));

        let next: ResourceManifest = [("a", "1")].into_iter().collect();
        store.commit(&next).unwrap();
        assert_eq!(store.load().unwrap(), Some(next));
    }

    #[test]
    fn test_store_corrupt_record_is_error() {
        let storage = MemoryStorage::new();
        storage
            .open(MANIFEST_REGION)
            .unwrap()
            .put(MANIFEST_KEY, &OriginResponse::new(200, "not json"))
            .unwrap();

        let store = ManifestStore::open(&storage).unwrap();
        assert!(store.load().is_err());
    }
}
