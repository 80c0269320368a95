//! HTTP proxy front for intercepted requests

pub mod server;

pub use server::ProxyServer;
