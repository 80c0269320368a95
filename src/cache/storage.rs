//! Cache storage traits
//!
//! A storage holds named regions; a region maps a logical request key to a
//! stored response. Opening a region that does not exist creates it empty.

use std::sync::Arc;

use anyhow::Result;

use crate::origin::OriginResponse;

/// Region served to clients
pub const LIVE_REGION: &str = "shellcache-app-cache";

/// Region populated during install and discarded after activate
pub const STAGING_REGION: &str = "shellcache-temp-cache";

/// Region holding the last committed manifest
pub const MANIFEST_REGION: &str = "shellcache-app-manifest";

/// A set of named cache regions
pub trait CacheStorage: Send + Sync {
    /// Open a region, creating it if it does not exist
    fn open(&self, name: &str) -> Result<Arc<dyn CacheRegion>>;

    /// Delete a region and everything in it
    ///
    /// Returns true if the region existed.
    fn delete(&self, name: &str) -> Result<bool>;

    /// Whether a region currently exists
    fn has(&self, name: &str) -> Result<bool>;
}

/// A single key -> response region
pub trait CacheRegion: Send + Sync {
    /// Look up a stored response
    fn get(&self, key: &str) -> Result<Option<OriginResponse>>;

    /// Store a response, replacing any previous entry for the key
    fn put(&self, key: &str, response: &OriginResponse) -> Result<()>;

    /// Remove an entry, returning true if it existed
    fn delete(&self, key: &str) -> Result<bool>;

    /// List all keys currently stored
    fn keys(&self) -> Result<Vec<String>>;
}
