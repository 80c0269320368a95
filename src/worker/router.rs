//! Request Router
//!
//! Decides, per intercepted request, whether to answer from the live region,
//! go online first, or stay out of the way. Only GET requests for resources
//! listed in the manifest are handled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::key::normalize_key;
use crate::cache::{CacheRegion, CacheStorage, LIVE_REGION};
use crate::manifest::{ResourceManifest, ROOT_KEY};
use crate::origin::{FetchRequest, Fetcher, OriginError, OriginResponse};

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Live region hit
    Cache,
    /// Fresh network response
    Network,
    /// Network failed, cached copy used instead
    Fallback,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Cache => "cache",
            ResponseSource::Network => "network",
            ResponseSource::Fallback => "fallback",
        }
    }
}

/// Routing result
#[derive(Debug)]
pub enum RouteOutcome {
    /// Not ours: hand the request to normal network handling untouched
    Passthrough,
    /// Answered by the router
    Served {
        response: OriginResponse,
        source: ResponseSource,
    },
}

/// Routes intercepted requests against the live region
pub struct RequestRouter {
    /// Manifest this worker was built with
    manifest: Arc<ResourceManifest>,
    /// Origin the worker is serving, without trailing slash
    origin: String,
    /// Region storage
    storage: Arc<dyn CacheStorage>,
    /// Network access
    fetcher: Arc<dyn Fetcher>,
    /// Cache-first hit counter
    hits: AtomicU64,
    /// Cache-first miss counter
    misses: AtomicU64,
}

impl RequestRouter {
    pub fn new(
        manifest: Arc<ResourceManifest>,
        origin: &str,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            manifest,
            origin: origin.trim_end_matches('/').to_string(),
            storage,
            fetcher,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Logical key for a request this router owns, None for passthrough
    pub fn route_key(&self, request: &FetchRequest) -> Option<String> {
        if !request.is_get() {
            return None;
        }
        let url = format!("{}{}", self.origin, request.path);
        let key = normalize_key(&url, &self.origin)?;
        self.manifest.contains(&key).then_some(key)
    }

    /// Handle one intercepted request
    pub async fn handle(&self, request: &FetchRequest) -> Result<RouteOutcome, OriginError> {
        let Some(key) = self.route_key(request) else {
            trace!(method = %request.method, path = %request.path, "Passthrough");
            return Ok(RouteOutcome::Passthrough);
        };

        if key == ROOT_KEY {
            self.online_first(&key, request).await
        } else {
            self.cache_first(&key, request).await
        }
    }

    /// Try the network, fall back to the cached copy if the network fails
    ///
    /// Any response the network resolves with replaces the cached copy,
    /// error statuses included; only partial content is never stored.
    async fn online_first(
        &self,
        key: &str,
        request: &FetchRequest,
    ) -> Result<RouteOutcome, OriginError> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_partial() {
                    debug!(key = key, "Not caching partial root response");
                } else {
                    self.store(key, &response);
                }
                Ok(RouteOutcome::Served {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(e) => match self.lookup(key) {
                Some(response) => {
                    debug!(key = key, error = %e, "Network failed, serving cached root document");
                    Ok(RouteOutcome::Served {
                        response,
                        source: ResponseSource::Fallback,
                    })
                }
                None => Err(e),
            },
        }
    }

    /// Serve from the live region, fetching and populating it on a miss
    async fn cache_first(
        &self,
        key: &str,
        request: &FetchRequest,
    ) -> Result<RouteOutcome, OriginError> {
        if let Some(response) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = key, "Cache HIT");
            return Ok(RouteOutcome::Served {
                response,
                source: ResponseSource::Cache,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = key, "Cache MISS, fetching");

        let response = self.fetcher.fetch(request).await?;
        if response.is_ok() && !response.is_partial() {
            self.store(key, &response);
        }
        Ok(RouteOutcome::Served {
            response,
            source: ResponseSource::Network,
        })
    }

    fn live(&self) -> Option<Arc<dyn CacheRegion>> {
        match self.storage.open(LIVE_REGION) {
            Ok(region) => Some(region),
            Err(e) => {
                warn!(error = %e, "Failed to open live region");
                None
            }
        }
    }

    /// Read a cached entry; storage errors count as a miss
    fn lookup(&self, key: &str) -> Option<OriginResponse> {
        match self.live()?.get(key) {
            Ok(found) => found,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to read cached entry");
                None
            }
        }
    }

    /// Write an entry; a failed write never fails the request
    fn store(&self, key: &str, response: &OriginResponse) {
        if let Some(live) = self.live() {
            if let Err(e) = live.put(key, response) {
                warn!(key = key, error = %e, "Failed to cache response");
            }
        }
    }

    /// Get cache-first statistics
    ///
    /// Returns (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
