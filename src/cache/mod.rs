//! Cache storage layer
//!
//! Named regions of path-keyed responses. Disk storage is the default and
//! survives restarts; memory storage backs tests and throwaway runs.

pub mod disk;
pub mod memory;
pub mod storage;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;
pub use storage::{CacheRegion, CacheStorage, LIVE_REGION, MANIFEST_REGION, STAGING_REGION};
