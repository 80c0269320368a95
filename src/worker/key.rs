//! Request URL -> logical cache key
//!
//! Keys are origin-relative paths without the leading slash, except the
//! root document which is always `/`.

use crate::manifest::ROOT_KEY;

/// Query suffix the app uses for cache busting
const VERSION_QUERY: &str = "?v=";

/// Derive the logical key for a request URL
///
/// Returns None when the URL does not belong to `origin`. The origin must
/// not carry a trailing slash.
pub fn normalize_key(url: &str, origin: &str) -> Option<String> {
    let rest = url.strip_prefix(origin)?;
    if !(rest.is_empty() || rest.starts_with(['/', '?', '#'])) {
        // Same prefix, different host (e.g. origin.example.com.evil)
        return None;
    }

    if rest.is_empty() || rest.starts_with("/#") {
        return Some(ROOT_KEY.to_string());
    }

    let mut key = rest.strip_prefix('/').unwrap_or(rest);
    if let Some(idx) = key.find(VERSION_QUERY) {
        key = &key[..idx];
    }
    if key.is_empty() {
        return Some(ROOT_KEY.to_string());
    }

    let decoded = urlencoding::decode(key)
        .map(|k| k.into_owned())
        .unwrap_or_else(|_| key.to_string());
    Some(decoded)
}
