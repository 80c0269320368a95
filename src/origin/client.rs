//! Origin HTTP Client
//!
//! Fetches resources from the application origin on behalf of the worker.
//! Statuses are returned as-is; only transport failures become errors.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use super::errors::OriginError;
use super::types::{is_hop_by_hop, CacheMode, FetchRequest, OriginResponse};

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

/// Anything that can perform a network fetch for the worker
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request; non-ok statuses are returned, not raised
    async fn fetch(&self, request: &FetchRequest) -> Result<OriginResponse, OriginError>;
}

/// A recent error entry for tracking
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: u64,
    pub method: String,
    pub path: String,
    pub error: String,
}

/// Client bound to a single origin (scheme + host + port, no trailing slash)
#[derive(Clone)]
pub struct OriginClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Origin every request path is appended to
    origin: String,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: Arc<AtomicU8>,
    /// Recent error log
    error_log: Arc<RwLock<VecDeque<ErrorEntry>>>,
}

impl OriginClient {
    /// Create a client for the given origin
    pub fn new(origin: &str) -> Result<Self> {
        let http_client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            origin: origin.trim_end_matches('/').to_string(),
            health: Arc::new(AtomicU8::new(HEALTH_HEALTHY)),
            error_log: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_ERROR_HISTORY))),
        })
    }

    /// Get the origin this client talks to
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Log an error to the error history ring buffer
    fn log_error(&self, method: &str, path: &str, error: &str) {
        let entry = ErrorEntry {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            method: method.to_string(),
            path: path.to_string(),
            error: error.to_string(),
        };

        let mut log = self
            .error_log
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Get connection health status string
    pub fn health_status(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    /// Get recent errors
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    async fn send(&self, request: &FetchRequest) -> Result<OriginResponse, OriginError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| OriginError::Request(format!("Invalid method {}: {}", request.method, e)))?;
        let url = format!("{}{}", self.origin, request.path);

        debug!(method = %method, url = %url, mode = ?request.cache_mode, "Fetching from origin");

        let mut builder = self.http_client.request(method, &url);
        for (name, value) in &request.headers {
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.cache_mode == CacheMode::Reload {
            builder = builder
                .header("Cache-Control", "no-cache")
                .header("Pragma", "no-cache");
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        debug!(url = %url, status = status, size = body.len(), "Origin responded");

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Fetcher for OriginClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<OriginResponse, OriginError> {
        match self.send(request).await {
            Ok(response) => {
                if response.status >= 500 {
                    self.health.store(HEALTH_DEGRADED, Ordering::Relaxed);
                } else {
                    self.health.store(HEALTH_HEALTHY, Ordering::Relaxed);
                }
                Ok(response)
            }
            Err(e) => {
                if e.is_network() {
                    self.health.store(HEALTH_UNHEALTHY, Ordering::Relaxed);
                }
                warn!(method = %request.method, path = %request.path, error = %e, "Origin fetch failed");
                self.log_error(&request.method, &request.path, &e.to_string());
                Err(e)
            }
        }
    }
}
