//! On-disk cache regions
//!
//! Each region is a directory under the cache root. Entries are addressed by
//! the SHA-1 of their key: `<hash>.meta` holds key, status, headers and the
//! name of the body file. Every write gets its own `<hash>.<random>.body`,
//! persisted before the meta is swapped in, so a reader always pairs a meta
//! with the body written alongside it. The replaced body is removed after
//! the swap; a reader that loses that race sees a miss.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::storage::{CacheRegion, CacheStorage};
use crate::origin::OriginResponse;

const META_EXT: &str = "meta";
const BODY_EXT: &str = "body";
const TMP_SUFFIX: &str = ".tmp";

/// Metadata stored next to each cached body
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    /// Logical key the entry was stored under
    key: String,
    /// HTTP status code
    status: u16,
    /// Response headers
    headers: Vec<(String, String)>,
    /// Body file name within the region directory
    body: String,
    /// Seconds since epoch when the entry was written
    stored_at: u64,
}

/// Disk-backed storage rooted at a single directory
pub struct DiskStorage {
    /// Root directory, one subdirectory per region
    root: PathBuf,
}

impl DiskStorage {
    /// Create storage in the platform cache directory
    pub fn new() -> Result<Self> {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("shellcache");

        Self::with_root(root)
    }

    /// Create storage rooted at a custom directory
    pub fn with_root(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache directory: {:?}", root))?;

        let storage = Self { root };

        // Clean up any stale files from interrupted writes in previous runs
        if let Ok(read_dir) = fs::read_dir(&storage.root) {
            for entry in read_dir.flatten() {
                if entry.path().is_dir() {
                    DiskRegion { dir: entry.path() }.cleanup();
                }
            }
        }

        info!(root = %storage.root.display(), "Disk cache storage initialized");

        Ok(storage)
    }

    fn region_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(anyhow!("Invalid cache region name: {:?}", name));
        }
        Ok(self.root.join(name))
    }
}

impl CacheStorage for DiskStorage {
    fn open(&self, name: &str) -> Result<Arc<dyn CacheRegion>> {
        let dir = self.region_dir(name)?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache region: {:?}", dir))?;

        Ok(Arc::new(DiskRegion { dir }))
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let dir = self.region_dir(name)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(region = name, "Deleted cache region");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to delete cache region: {:?}", dir))
            }
        }
    }

    fn has(&self, name: &str) -> Result<bool> {
        Ok(self.region_dir(name)?.is_dir())
    }
}

/// A single region directory
pub struct DiskRegion {
    dir: PathBuf,
}

impl DiskRegion {
    /// File stem for a key
    fn stem(key: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", Self::stem(key), META_EXT))
    }

    /// Write a file atomically using tempfile
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .suffix(TMP_SUFFIX)
            .tempfile_in(&self.dir)
            .context("Failed to create temp file for cache")?;

        tmp.write_all(data).context("Failed to write cache file")?;

        tmp.persist(path)
            .with_context(|| format!("Failed to persist cache file: {:?}", path))?;
        Ok(())
    }

    /// Write a body under a fresh name and return that name
    fn write_body(&self, key: &str, data: &[u8]) -> Result<String> {
        let prefix = format!("{}.", Self::stem(key));
        let suffix = format!(".{}", BODY_EXT);
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(&suffix)
            .tempfile_in(&self.dir)
            .context("Failed to create cache body file")?;

        tmp.write_all(data).context("Failed to write cache body")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to flush cache body")?;

        let (_, path) = tmp.keep().context("Failed to keep cache body")?;
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Cache body has no file name: {:?}", path))
    }

    fn read_meta(path: &Path) -> Result<Option<EntryMeta>> {
        match fs::read(path) {
            Ok(data) => {
                let meta = serde_json::from_slice(&data)
                    .with_context(|| format!("Corrupt cache metadata: {:?}", path))?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read cache metadata: {:?}", path)),
        }
    }

    fn remove_body(&self, name: &str) {
        if let Err(e) = fs::remove_file(self.dir.join(name)) {
            if e.kind() != ErrorKind::NotFound {
                warn!(body = name, error = %e, "Failed to remove replaced cache body");
            }
        }
    }

    /// Remove temp files and bodies no meta refers to
    fn cleanup(&self) {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return;
        };
        let paths: Vec<PathBuf> = read_dir.flatten().map(|entry| entry.path()).collect();

        let referenced: HashSet<String> = paths
            .iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == META_EXT))
            .filter_map(|path| Self::read_meta(path).ok().flatten())
            .map(|meta| meta.body)
            .collect();

        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let orphan_body = path.extension().is_some_and(|ext| ext == BODY_EXT)
                && !referenced.contains(&name);
            if name.ends_with(TMP_SUFFIX) || orphan_body {
                debug!(path = %path.display(), "Removing stale cache file");
                let _ = fs::remove_file(&path);
            }
        }
    }
}

impl CacheRegion for DiskRegion {
    fn get(&self, key: &str) -> Result<Option<OriginResponse>> {
        let Some(meta) = Self::read_meta(&self.meta_path(key))? else {
            return Ok(None);
        };
        if meta.key != key {
            warn!(key = key, stored = %meta.key, "Cache key hash collision");
            return Ok(None);
        }

        let body_path = self.dir.join(&meta.body);
        let body = match fs::read(&body_path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key = key, "Cache entry replaced while reading, treating as miss");
                return Ok(None);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read cache body: {:?}", body_path))
            }
        };

        Ok(Some(OriginResponse {
            status: meta.status,
            headers: meta.headers,
            body: Bytes::from(body),
        }))
    }

    fn put(&self, key: &str, response: &OriginResponse) -> Result<()> {
        // The region may have been deleted while this handle was held
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache region: {:?}", self.dir))?;

        let meta_path = self.meta_path(key);
        let previous = Self::read_meta(&meta_path).ok().flatten();

        let body = self.write_body(key, &response.body)?;
        let meta = EntryMeta {
            key: key.to_string(),
            status: response.status,
            headers: response.headers.clone(),
            body: body.clone(),
            stored_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let meta_json = serde_json::to_vec(&meta).context("Failed to serialize cache metadata")?;

        if let Err(e) = self.write_atomic(&meta_path, &meta_json) {
            self.remove_body(&body);
            return Err(e);
        }
        if let Some(previous) = previous.filter(|p| p.body != body) {
            self.remove_body(&previous.body);
        }

        debug!(key = key, size = response.body.len(), "Stored cache entry");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let meta_path = self.meta_path(key);
        let previous = Self::read_meta(&meta_path).ok().flatten();
        let existed = match fs::remove_file(&meta_path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to delete cache entry: {:?}", meta_path))
            }
        };
        if let Some(previous) = previous {
            self.remove_body(&previous.body);
        }

        if existed {
            debug!(key = key, "Deleted cache entry");
        }
        Ok(existed)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list cache region: {:?}", self.dir))
            }
        };

        let mut keys = Vec::new();
        for entry in read_dir {
            let path = entry.context("Failed to read cache region entry")?.path();
            if path.extension().is_some_and(|ext| ext == META_EXT) {
                if let Some(meta) = Self::read_meta(&path)? {
                    keys.push(meta.key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
