//! Application origin client

pub mod client;
pub mod errors;
pub mod types;

pub use client::{Fetcher, OriginClient};
pub use errors::OriginError;
pub use types::*;
