//! Cache Lifecycle Manager
//!
//! Install stages the shell; activate reconciles the staged shell and the
//! previously committed manifest into the live region. A failure anywhere in
//! reconciliation wipes all three regions instead of leaving a half-migrated
//! cache behind.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheRegion, CacheStorage, LIVE_REGION, MANIFEST_REGION, STAGING_REGION};
use crate::manifest::{ManifestStore, ResourceManifest};
use crate::origin::{FetchRequest, Fetcher, OriginError};

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing installed yet
    Idle,
    /// Shell fetch in progress
    Installing,
    /// Shell staged, waiting for activation
    Staged,
    /// Activation in progress
    Reconciling,
    /// Live region reconciled and manifest committed
    Committed,
    /// Reconciliation failed and every region was discarded
    Reset,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Installing => "installing",
            LifecycleState::Staged => "staged",
            LifecycleState::Reconciling => "reconciling",
            LifecycleState::Committed => "committed",
            LifecycleState::Reset => "reset",
        }
    }
}

/// Lifecycle errors surfaced to the host
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Failed to fetch shell resource '{path}': {source}")]
    ShellFetch {
        path: String,
        #[source]
        source: OriginError,
    },

    #[error("Cannot activate before an install has been staged")]
    NotInstalled,

    #[error("Cache storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Result of an activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// No previous manifest: live rebuilt from staging
    Bootstrapped { staged: usize },
    /// Previous manifest found: unchanged entries kept, others evicted
    Upgraded {
        retained: usize,
        evicted: usize,
        staged: usize,
    },
    /// Reconciliation failed and all regions were deleted
    Reset { reason: String },
}

/// Drives install and activate for one manifest
pub struct LifecycleManager {
    /// Manifest this worker was built with
    manifest: Arc<ResourceManifest>,
    /// Shell paths fetched eagerly on install
    shell: Vec<String>,
    /// Region storage
    storage: Arc<dyn CacheStorage>,
    /// Network access
    fetcher: Arc<dyn Fetcher>,
    /// Current state
    state: LifecycleState,
}

impl LifecycleManager {
    /// Create a manager in the Idle state
    pub fn new(
        manifest: Arc<ResourceManifest>,
        shell: Vec<String>,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            manifest,
            shell,
            storage,
            fetcher,
            state: LifecycleState::Idle,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Fetch the shell with cache busting and stage it
    ///
    /// Every shell resource must come back ok before anything is written.
    /// On failure the previous state is restored.
    pub async fn install(&mut self) -> Result<usize, LifecycleError> {
        let previous = self.state;
        self.state = LifecycleState::Installing;
        info!(resources = self.shell.len(), "Installing application shell");

        match self.stage_shell().await {
            Ok(count) => {
                self.state = LifecycleState::Staged;
                info!(staged = count, "Application shell staged");
                Ok(count)
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    async fn stage_shell(&self) -> Result<usize, LifecycleError> {
        let mut fetched = Vec::with_capacity(self.shell.len());
        for path in &self.shell {
            let request = FetchRequest::for_key(path).reload();
            let response =
                self.fetcher
                    .fetch(&request)
                    .await
                    .map_err(|source| LifecycleError::ShellFetch {
                        path: path.clone(),
                        source,
                    })?;
            if !response.is_ok() || response.is_partial() {
                return Err(LifecycleError::ShellFetch {
                    path: path.clone(),
                    source: OriginError::from_status(response.status, &request.path),
                });
            }
            fetched.push((path, response));
        }

        let staging = self
            .storage
            .open(STAGING_REGION)
            .context("Failed to open staging region")?;
        for (path, response) in &fetched {
            staging
                .put(path, response)
                .with_context(|| format!("Failed to stage '{}'", path))?;
        }
        Ok(fetched.len())
    }

    /// Reconcile staging and the persisted manifest into the live region
    ///
    /// Reconciliation failures are not returned as errors: they end in
    /// [`ActivationOutcome::Reset`] after all regions have been deleted.
    pub fn activate(&mut self) -> Result<ActivationOutcome, LifecycleError> {
        match self.state {
            LifecycleState::Idle | LifecycleState::Installing => {
                return Err(LifecycleError::NotInstalled)
            }
            _ => {}
        }

        self.state = LifecycleState::Reconciling;
        match self.reconcile() {
            Ok(outcome) => {
                self.state = LifecycleState::Committed;
                info!(outcome = ?outcome, "Activation committed");
                Ok(outcome)
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(error = %reason, "Failed to upgrade cache, resetting all regions");
                self.reset();
                self.state = LifecycleState::Reset;
                Ok(ActivationOutcome::Reset { reason })
            }
        }
    }

    fn reconcile(&self) -> Result<ActivationOutcome> {
        let mut live = self
            .storage
            .open(LIVE_REGION)
            .context("Failed to open live region")?;
        let staging = self
            .storage
            .open(STAGING_REGION)
            .context("Failed to open staging region")?;
        let store = ManifestStore::open(self.storage.as_ref())?;

        let Some(previous) = store.load()? else {
            debug!("No persisted manifest, rebuilding live region from staging");
            self.storage
                .delete(LIVE_REGION)
                .context("Failed to clear live region")?;
            live = self
                .storage
                .open(LIVE_REGION)
                .context("Failed to recreate live region")?;
            let staged = copy_region(staging.as_ref(), live.as_ref())?;
            self.storage
                .delete(STAGING_REGION)
                .context("Failed to discard staging region")?;
            store.commit(&self.manifest)?;
            return Ok(ActivationOutcome::Bootstrapped { staged });
        };

        let mut retained = 0;
        let mut evicted = 0;
        for key in live.keys().context("Failed to list live region")? {
            let current = self.manifest.fingerprint(&key);
            if current.is_none() || current != previous.fingerprint(&key) {
                live.delete(&key)
                    .with_context(|| format!("Failed to evict '{}'", key))?;
                debug!(key = %key, "Evicted changed resource");
                evicted += 1;
            } else {
                retained += 1;
            }
        }

        let staged = copy_region(staging.as_ref(), live.as_ref())?;
        self.storage
            .delete(STAGING_REGION)
            .context("Failed to discard staging region")?;
        store.commit(&self.manifest)?;

        Ok(ActivationOutcome::Upgraded {
            retained,
            evicted,
            staged,
        })
    }

    /// Delete every region unconditionally
    fn reset(&self) {
        for region in [LIVE_REGION, STAGING_REGION, MANIFEST_REGION] {
            if let Err(e) = self.storage.delete(region) {
                warn!(region = region, error = %e, "Failed to delete region during reset");
            }
        }
    }
}

/// Copy every entry of `from` into `to`, overwriting
fn copy_region(from: &dyn CacheRegion, to: &dyn CacheRegion) -> Result<usize> {
    let mut copied = 0;
    for key in from.keys().context("Failed to list staging region")? {
        if let Some(response) = from.get(&key)? {
            to.put(&key, &response)
                .with_context(|| format!("Failed to copy '{}' into live region", key))?;
            copied += 1;
        }
    }
    Ok(copied)
}
