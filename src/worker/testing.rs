//! Scripted fetcher for worker tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::origin::{CacheMode, FetchRequest, Fetcher, OriginError, OriginResponse};

/// Answers from a fixed table keyed by request path; unknown paths get 404
#[derive(Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<String, OriginResponse>>,
    offline: AtomicBool,
    calls: Mutex<Vec<(String, String, CacheMode)>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the response for a request path (e.g. `/main.dart.js`)
    pub fn respond(&self, path: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(path.to_string(), OriginResponse::new(status, body.to_string()));
    }

    /// Make every fetch fail with a network error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Paths requested so far, in order
    pub fn requested_paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, path, _)| path.clone())
            .collect()
    }

    /// Cache modes used so far, in order
    pub fn cache_modes(&self) -> Vec<CacheMode> {
        self.calls.lock().unwrap().iter().map(|(_, _, m)| *m).collect()
    }

    /// Methods used so far, in order
    pub fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _, _)| m.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<OriginResponse, OriginError> {
        self.calls.lock().unwrap().push((
            request.method.clone(),
            request.path.clone(),
            request.cache_mode,
        ));
        if self.offline.load(Ordering::SeqCst) {
            return Err(OriginError::Network("connection refused".to_string()));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(&request.path)
            .cloned()
            .unwrap_or_else(|| OriginResponse::new(404, "not found")))
    }
}
