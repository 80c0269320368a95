//! Origin request/response types
//!
//! Plain values passed between the proxy listener, the worker and the origin
//! client. Bodies are `Bytes` so cached and fetched responses share storage.

use bytes::Bytes;

/// Headers that describe a single connection hop and must not be forwarded
/// or stored.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header should be dropped when forwarding or storing
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// How intermediate HTTP caches should treat an outbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Normal request, intermediate caches may answer
    #[default]
    Default,
    /// Bypass any intermediate cache and go to the origin
    Reload,
}

/// A request headed for the origin
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// HTTP method, upper-case
    pub method: String,
    /// Origin-relative path including any query, always starting with `/`
    pub path: String,
    /// Request headers as received (hop-by-hop headers are filtered on send)
    pub headers: Vec<(String, String)>,
    /// Request body (empty for GET)
    pub body: Bytes,
    /// Cache-busting behaviour
    pub cache_mode: CacheMode,
}

impl FetchRequest {
    /// Build a plain GET for an origin-relative path
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            cache_mode: CacheMode::Default,
        }
    }

    /// Build a GET for a manifest key (`/` or a path without leading slash)
    pub fn for_key(key: &str) -> Self {
        Self::get(key_to_path(key))
    }

    /// Switch this request to cache-busting mode
    pub fn reload(mut self) -> Self {
        self.cache_mode = CacheMode::Reload;
        self
    }

    /// Whether this is a GET request
    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

/// Convert a logical manifest key into an origin-relative request path,
/// percent-encoding each path segment.
pub fn key_to_path(key: &str) -> String {
    if key == "/" {
        return "/".to_string();
    }
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("/{}", encoded.join("/"))
}

/// A response as returned by the origin or read back from a cache region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers (hop-by-hop headers already removed)
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Bytes,
}

impl OriginResponse {
    /// Create a response with no headers
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header, builder style
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Whether the status is in the 2xx range
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// A 206 answer to a ranged request; never a whole resource
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Look up a header value case-insensitively
    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
