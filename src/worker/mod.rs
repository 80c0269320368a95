//! Caching worker
//!
//! Binds the lifecycle manager, the request router and the offline sync to
//! the four event types the host delivers: install, activate, fetch and
//! message. Install and activate are serialized through one lock.

pub mod key;
pub mod lifecycle;
pub mod offline;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::cache::{CacheStorage, LIVE_REGION};
use crate::manifest::ResourceManifest;
use crate::origin::{FetchRequest, Fetcher, OriginError, OriginResponse};

pub use lifecycle::{ActivationOutcome, LifecycleError, LifecycleManager, LifecycleState};
pub use router::{RequestRouter, ResponseSource, RouteOutcome};

/// Explicit messages the worker understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Activate a staged worker without waiting
    SkipWaiting,
    /// Fetch every manifest resource not cached yet
    DownloadOffline,
}

/// Construction options
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Origin being fronted, e.g. `https://app.example.com`
    pub origin: String,
    /// Shell paths fetched on install, all listed in the manifest
    pub shell: Vec<String>,
    /// Stay staged after install until a SkipWaiting message arrives
    pub wait_for_skip: bool,
}

/// Answer to an intercepted fetch
#[derive(Debug)]
pub struct FetchReply {
    pub response: OriginResponse,
    /// None when the request was passed through
    pub source: Option<ResponseSource>,
}

/// Snapshot of worker state for status reporting
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: LifecycleState,
    pub active: bool,
    pub manifest_entries: usize,
    pub live_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// One worker instance bound to one manifest
pub struct ServiceWorker {
    manifest: Arc<ResourceManifest>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    lifecycle: Mutex<LifecycleManager>,
    router: RequestRouter,
    wait_for_skip: bool,
    /// Set once an activation has finished; until then nothing is intercepted
    active: AtomicBool,
}

impl ServiceWorker {
    /// Build a worker; fails if a shell path is not listed in the manifest
    pub fn new(
        manifest: ResourceManifest,
        options: WorkerOptions,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        if let Some(path) = options.shell.iter().find(|p| !manifest.contains(p)) {
            return Err(anyhow!("Shell resource '{}' is not listed in the manifest", path));
        }

        let manifest = Arc::new(manifest);
        let lifecycle = LifecycleManager::new(
            Arc::clone(&manifest),
            options.shell,
            Arc::clone(&storage),
            Arc::clone(&fetcher),
        );
        let router = RequestRouter::new(
            Arc::clone(&manifest),
            &options.origin,
            Arc::clone(&storage),
            Arc::clone(&fetcher),
        );

        Ok(Self {
            manifest,
            storage,
            fetcher,
            lifecycle: Mutex::new(lifecycle),
            router,
            wait_for_skip: options.wait_for_skip,
            active: AtomicBool::new(false),
        })
    }

    /// Run install and, unless told to wait, activate
    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.on_install().await?;
        if self.wait_for_skip {
            info!("Shell staged, waiting for skipWaiting before activating");
            return Ok(());
        }
        self.on_activate().await?;
        Ok(())
    }

    /// Install event
    pub async fn on_install(&self) -> Result<usize, LifecycleError> {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.install().await
    }

    /// Activate event
    pub async fn on_activate(&self) -> Result<ActivationOutcome, LifecycleError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let outcome = lifecycle.activate()?;
        self.active.store(true, Ordering::SeqCst);
        Ok(outcome)
    }

    /// Fetch event
    ///
    /// Before the first activation every request is passed through.
    pub async fn on_fetch(&self, request: FetchRequest) -> Result<FetchReply, OriginError> {
        if self.is_active() {
            if let RouteOutcome::Served { response, source } = self.router.handle(&request).await? {
                return Ok(FetchReply {
                    response,
                    source: Some(source),
                });
            }
        }

        let response = self.fetcher.fetch(&request).await?;
        Ok(FetchReply {
            response,
            source: None,
        })
    }

    /// Message event
    ///
    /// Returns a short human-readable acknowledgement.
    pub async fn on_message(&self, message: Message) -> Result<String> {
        match message {
            Message::SkipWaiting => {
                if self.is_active() {
                    return Ok("Worker already active".to_string());
                }
                let outcome = self.on_activate().await?;
                Ok(format!("Activated: {:?}", outcome))
            }
            Message::DownloadOffline => {
                let manifest = Arc::clone(&self.manifest);
                let storage = Arc::clone(&self.storage);
                let fetcher = Arc::clone(&self.fetcher);
                tokio::spawn(async move {
                    if let Err(e) =
                        offline::download_offline(&manifest, storage.as_ref(), fetcher.as_ref()).await
                    {
                        error!(error = %format!("{:#}", e), "Offline sync failed");
                    }
                });
                debug!("Offline sync spawned");
                Ok("Offline sync started".to_string())
            }
        }
    }

    /// Whether the worker controls traffic
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Current status snapshot
    pub async fn status(&self) -> WorkerStatus {
        let state = self.lifecycle.lock().await.state();
        let live_entries = match self.storage.has(LIVE_REGION) {
            Ok(true) => self
                .storage
                .open(LIVE_REGION)
                .and_then(|live| live.keys())
                .map(|keys| keys.len())
                .unwrap_or(0),
            _ => 0,
        };
        let (hits, misses) = self.router.stats();

        WorkerStatus {
            state,
            active: self.is_active(),
            manifest_entries: self.manifest.len(),
            live_entries,
            hits,
            misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;
    use testing::StubFetcher;

    fn worker(wait_for_skip: bool) -> (Arc<MemoryStorage>, Arc<StubFetcher>, ServiceWorker) {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond("/", 200, "root");
        fetcher.respond("/index.html", 200, "index");
        fetcher.respond("/main.dart.js", 200, "main");
        fetcher.respond("/favicon.png", 200, "png");
        let manifest: ResourceManifest = [
            ("/", "r"),
            ("index.html", "r"),
            ("main.dart.js", "m"),
            ("favicon.png", "f"),
        ]
        .into_iter()
        .collect();
        let options = WorkerOptions {
            origin: "http://localhost:8080".to_string(),
            shell: vec!["main.dart.js".to_string(), "index.html".to_string()],
            wait_for_skip,
        };
        let worker = ServiceWorker::new(manifest, options, storage.clone(), fetcher.clone()).unwrap();
        (storage, fetcher, worker)
    }

    #[test]
    fn test_shell_must_be_listed() {
        let options = WorkerOptions {
            origin: "http://localhost:8080".to_string(),
            shell: vec!["missing.js".to_string()],
            wait_for_skip: false,
        };
        let result = ServiceWorker::new(
            ResourceManifest::default(),
            options,
            Arc::new(MemoryStorage::new()),
            Arc::new(StubFetcher::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_passthrough_until_activated() {
        let (storage, _fetcher, worker) = worker(true);
        worker.start().await.unwrap();

        assert!(!worker.is_active());
        assert_eq!(worker.status().await.state, LifecycleState::Staged);
        let reply = worker.on_fetch(FetchRequest::get("/favicon.png")).await.unwrap();
        assert!(reply.source.is_none());
        assert!(!storage.has(LIVE_REGION).unwrap());

        let ack = worker.on_message(Message::SkipWaiting).await.unwrap();
        assert!(ack.contains("Bootstrapped"));
        assert!(worker.is_active());

        let reply = worker.on_fetch(FetchRequest::get("/favicon.png")).await.unwrap();
        assert_eq!(reply.source, Some(ResponseSource::Network));
        let reply = worker.on_fetch(FetchRequest::get("/favicon.png")).await.unwrap();
        assert_eq!(reply.source, Some(ResponseSource::Cache));
    }

    #[tokio::test]
    async fn test_start_activates_and_serves_shell_from_cache() {
        let (_storage, fetcher, worker) = worker(false);
        worker.start().await.unwrap();

        assert!(worker.is_active());
        let before = fetcher.call_count();
        let reply = worker.on_fetch(FetchRequest::get("/main.dart.js?v=7")).await.unwrap();
        assert_eq!(reply.source, Some(ResponseSource::Cache));
        assert_eq!(&reply.response.body[..], b"main");
        assert_eq!(fetcher.call_count(), before);

        let status = worker.status().await;
        assert_eq!(status.state, LifecycleState::Committed);
        assert_eq!(status.manifest_entries, 4);
        assert_eq!(status.live_entries, 2);
        assert_eq!((status.hits, status.misses), (1, 0));
    }

    #[tokio::test]
    async fn test_unlisted_and_non_get_are_forwarded() {
        let (_storage, fetcher, worker) = worker(false);
        worker.start().await.unwrap();
        fetcher.respond("/api/items", 200, "[]");

        let mut post = FetchRequest::get("/main.dart.js");
        post.method = "POST".to_string();
        let reply = worker.on_fetch(post).await.unwrap();
        assert!(reply.source.is_none());
        assert_eq!(fetcher.methods().last().map(String::as_str), Some("POST"));

        let reply = worker.on_fetch(FetchRequest::get("/api/items")).await.unwrap();
        assert!(reply.source.is_none());
        assert_eq!(&reply.response.body[..], b"[]");
    }

    #[tokio::test]
    async fn test_skip_waiting_when_active_is_noop() {
        let (_storage, _fetcher, worker) = worker(false);
        worker.start().await.unwrap();

        let ack = worker.on_message(Message::SkipWaiting).await.unwrap();
        assert_eq!(ack, "Worker already active");
    }

    async fn wait_for_live_entries(worker: &ServiceWorker, expected: usize) {
        for _ in 0..200 {
            if worker.status().await.live_entries == expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("live region never reached {} entries", expected);
    }

    #[tokio::test]
    async fn test_download_offline_message_fills_live_region() {
        let (_storage, fetcher, worker) = worker(false);
        worker.start().await.unwrap();

        let ack = worker.on_message(Message::DownloadOffline).await.unwrap();
        assert_eq!(ack, "Offline sync started");

        wait_for_live_entries(&worker, 4).await;
        let synced = fetcher.requested_paths();
        assert!(synced.contains(&"/".to_string()));
        assert!(synced.contains(&"/favicon.png".to_string()));
    }

    #[tokio::test]
    async fn test_download_offline_failure_stores_nothing() {
        let (_storage, fetcher, worker) = worker(false);
        worker.start().await.unwrap();
        fetcher.respond("/favicon.png", 500, "down");

        let before = fetcher.call_count();
        worker.on_message(Message::DownloadOffline).await.unwrap();
        for _ in 0..200 {
            if fetcher.call_count() >= before + 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(worker.status().await.live_entries, 2);
    }
}
