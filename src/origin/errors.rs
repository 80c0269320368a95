//! Origin Error Types
//!
//! Structured errors for requests made against the application origin.

/// Origin request error types
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Origin returned HTTP {0}: {1}")]
    Status(u16, String),

    #[error("Request error: {0}")]
    Request(String),
}

impl OriginError {
    /// Create an OriginError from a non-ok HTTP status and a short context
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            408 | 504 => OriginError::Timeout,
            _ => OriginError::Status(status, context.to_string()),
        }
    }

    /// Whether the error came from the transport rather than the origin
    pub fn is_network(&self) -> bool {
        matches!(self, OriginError::Network(_) | OriginError::Timeout)
    }
}

impl From<reqwest::Error> for OriginError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            OriginError::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            OriginError::Network(e.to_string())
        } else {
            OriginError::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(matches!(OriginError::from_status(504, "x"), OriginError::Timeout));
        match OriginError::from_status(404, "/main.dart.js") {
            OriginError::Status(code, ctx) => {
                assert_eq!(code, 404);
                assert_eq!(ctx, "/main.dart.js");
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_is_network() {
        assert!(OriginError::Network("refused".into()).is_network());
        assert!(OriginError::Timeout.is_network());
        assert!(!OriginError::Status(500, String::new()).is_network());
    }
}
