//! Daemon configuration from environment variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `SHELLCACHE_ORIGIN` | Origin being fronted (required) |
//! | `SHELLCACHE_MANIFEST` | Path to the resource manifest JSON (required) |
//! | `SHELLCACHE_SHELL` | Comma-separated shell paths fetched on install |
//! | `SHELLCACHE_LISTEN` | Proxy listen address |
//! | `SHELLCACHE_SOCKET` | IPC socket path |
//! | `SHELLCACHE_CACHE_DIR` | Root directory for disk storage |
//! | `SHELLCACHE_STORAGE` | `disk` or `memory` |
//! | `SHELLCACHE_WAIT_FOR_SKIP` | Stay staged until a skipWaiting message |

use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

use crate::ipc::SOCKET_PATH;
use crate::manifest::ROOT_KEY;

/// Default proxy listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

/// Default shell, fetched eagerly on install
pub const DEFAULT_SHELL: &[&str] = &[
    "main.dart.js",
    "index.html",
    "assets/AssetManifest.json",
    "assets/FontManifest.json",
];

/// Backing store for cache regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Disk,
    Memory,
}

/// Settings for `serve`
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// `scheme://host[:port]`, no trailing slash
    pub origin: String,
    pub manifest_path: PathBuf,
    pub shell: Vec<String>,
    pub listen: SocketAddr,
    pub socket_path: PathBuf,
    /// None means the platform cache directory
    pub cache_dir: Option<PathBuf>,
    pub storage: StorageKind,
    pub wait_for_skip: bool,
}

impl DaemonConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let origin = lookup("SHELLCACHE_ORIGIN")
            .ok_or_else(|| anyhow!("SHELLCACHE_ORIGIN is not set"))?;
        let origin = parse_origin(&origin).context("Invalid SHELLCACHE_ORIGIN")?;

        let manifest_path = lookup("SHELLCACHE_MANIFEST")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("SHELLCACHE_MANIFEST is not set"))?;

        let shell = match lookup("SHELLCACHE_SHELL") {
            Some(list) => parse_shell(&list),
            None => DEFAULT_SHELL.iter().map(|s| s.to_string()).collect(),
        };

        let listen = lookup("SHELLCACHE_LISTEN")
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
            .parse()
            .context("Invalid SHELLCACHE_LISTEN")?;

        let storage = match lookup("SHELLCACHE_STORAGE").as_deref() {
            None | Some("disk") => StorageKind::Disk,
            Some("memory") => StorageKind::Memory,
            Some(other) => {
                return Err(anyhow!(
                    "Invalid SHELLCACHE_STORAGE '{}': expected 'disk' or 'memory'",
                    other
                ))
            }
        };

        let wait_for_skip = lookup("SHELLCACHE_WAIT_FOR_SKIP")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            origin,
            manifest_path,
            shell,
            listen,
            socket_path: socket_path_from(&lookup),
            cache_dir: lookup("SHELLCACHE_CACHE_DIR").map(PathBuf::from),
            storage,
            wait_for_skip,
        })
    }
}

/// IPC socket path, for commands that only talk to a running daemon
pub fn socket_path_from_env() -> PathBuf {
    socket_path_from(&|name: &str| std::env::var(name).ok())
}

fn socket_path_from<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("SHELLCACHE_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SOCKET_PATH))
}

fn parse_origin(raw: &str) -> Result<String> {
    let url = Url::parse(raw).with_context(|| format!("'{}' is not an absolute URL", raw))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(anyhow!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err(anyhow!("'{}' has no host", raw));
    }
    Ok(url.origin().ascii_serialization())
}

/// Shell entries are manifest keys: no leading slash, except the root `/`
fn parse_shell(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.trim_start_matches('/') {
            "" => ROOT_KEY.to_string(),
            key => key.to_string(),
        })
        .collect()
}
