//! Offline bulk sync
//!
//! Fetches every manifest resource the live region does not hold yet and
//! stores them as one batch: if any fetch fails, nothing is written.

use std::collections::HashSet;

use anyhow::{Context, Result};
use tracing::info;

use crate::cache::{CacheStorage, LIVE_REGION};
use crate::manifest::ResourceManifest;
use crate::origin::{FetchRequest, Fetcher, OriginError};

/// Manifest paths missing from the live region, in manifest order
pub fn missing_resources(
    manifest: &ResourceManifest,
    storage: &dyn CacheStorage,
) -> Result<Vec<String>> {
    let live = storage
        .open(LIVE_REGION)
        .context("Failed to open live region")?;
    let present: HashSet<String> = live
        .keys()
        .context("Failed to list live region")?
        .into_iter()
        .collect();

    Ok(manifest
        .paths()
        .filter(|path| !present.contains(*path))
        .map(String::from)
        .collect())
}

/// Make every manifest resource available offline
///
/// Returns the number of entries stored.
pub async fn download_offline(
    manifest: &ResourceManifest,
    storage: &dyn CacheStorage,
    fetcher: &dyn Fetcher,
) -> Result<usize> {
    let missing = missing_resources(manifest, storage)?;
    if missing.is_empty() {
        info!("Offline sync: everything already cached");
        return Ok(0);
    }

    info!(missing = missing.len(), "Offline sync started");

    let mut fetched = Vec::with_capacity(missing.len());
    for path in &missing {
        let request = FetchRequest::for_key(path);
        let response = fetcher
            .fetch(&request)
            .await
            .with_context(|| format!("Offline sync failed to fetch '{}'", path))?;
        if !response.is_ok() || response.is_partial() {
            return Err(OriginError::from_status(response.status, &request.path))
                .with_context(|| format!("Offline sync failed to fetch '{}'", path));
        }
        fetched.push((path, response));
    }

    let live = storage
        .open(LIVE_REGION)
        .context("Failed to open live region")?;
    for (path, response) in &fetched {
        live.put(path, response)
            .with_context(|| format!("Offline sync failed to store '{}'", path))?;
    }

    info!(stored = fetched.len(), "Offline sync complete");
    Ok(fetched.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;
    use crate::origin::OriginResponse;
    use crate::worker::testing::StubFetcher;

    fn manifest() -> ResourceManifest {
        [("/", "r"), ("index.html", "r"), ("main.dart.js", "m"), ("favicon.png", "f")]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_missing_resources() {
        let storage = MemoryStorage::new();
        storage
            .open(LIVE_REGION)
            .unwrap()
            .put("main.dart.js", &OriginResponse::new(200, "m"))
            .unwrap();

        let missing = missing_resources(&manifest(), &storage).unwrap();
        assert_eq!(missing, vec!["/", "favicon.png", "index.html"]);
    }

    #[tokio::test]
    async fn test_download_offline_fetches_only_missing() {
        let storage = MemoryStorage::new();
        storage
            .open(LIVE_REGION)
            .unwrap()
            .put("main.dart.js", &OriginResponse::new(200, "m"))
            .unwrap();
        let fetcher = StubFetcher::new();
        fetcher.respond("/", 200, "root");
        fetcher.respond("/index.html", 200, "index");
        fetcher.respond("/favicon.png", 200, "png");

        let stored = download_offline(&manifest(), &storage, &fetcher).await.unwrap();

        assert_eq!(stored, 3);
        assert_eq!(fetcher.requested_paths(), vec!["/", "/favicon.png", "/index.html"]);
        let live = storage.open(LIVE_REGION).unwrap();
        assert_eq!(live.keys().unwrap().len(), 4);

        // A second run has nothing left to do
        assert_eq!(download_offline(&manifest(), &storage, &fetcher).await.unwrap(), 0);
        assert_eq!(fetcher.call_count(), 3);
    }

    #[tokio::test]
    async fn test_download_offline_is_all_or_nothing() {
        let storage = MemoryStorage::new();
        let fetcher = StubFetcher::new();
        fetcher.respond("/", 200, "root");
        fetcher.respond("/index.html", 200, "index");
        // main.dart.js and favicon.png come back 404

        assert!(download_offline(&manifest(), &storage, &fetcher).await.is_err());
        assert!(storage.open(LIVE_REGION).unwrap().keys().unwrap().is_empty());
    }
}
