//! Unified error types for modcache.
//!
//! Every failure on the request path ends up as one of these variants, and
//! each variant maps to exactly one HTTP status for the caller.

use std::io;

/// Unified error types for the modcache server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Name lookup through the configured resolver failed or timed out.
    #[error("RESOLUTION_FAILED: {0}")]
    Resolution(String),

    /// Transport-level connect failure (TCP, proxy handshake, TLS).
    #[error("DIAL_FAILED: {0}")]
    Dial(String),

    /// Upstream answered with a non-success status.
    #[error("UPSTREAM_STATUS: upstream returned {status}")]
    UpstreamStatus { status: u16 },

    /// Network failure while talking to upstream.
    #[error("UPSTREAM_ERROR: {0}")]
    UpstreamTransport(String),

    /// Upstream body was not well-formed.
    #[error("VALIDATION_FAILED: {0}")]
    Validation(String),

    /// Local read/write/rename failure.
    #[error("STORAGE_ERROR: {0}")]
    Storage(#[from] io::Error),

    /// No artifact is stored for the key. A normal miss signal.
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Request path cannot be used as a cache key.
    #[error("INVALID_KEY: {0}")]
    InvalidKey(String),
}

impl Error {
    /// HTTP status reported to the caller for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Resolution(_) | Error::Dial(_) | Error::UpstreamTransport(_) | Error::Validation(_) => 502,
            Error::UpstreamStatus { status } => *status,
            Error::Storage(_) => 500,
            Error::NotFound(_) | Error::InvalidKey(_) => 404,
        }
    }

    /// Whether this is the plain cache-miss signal rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UpstreamStatus { status: 404 };
        assert!(err.to_string().contains("UPSTREAM_STATUS"));
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_gateway_statuses() {
        assert_eq!(Error::Resolution("x".into()).status_code(), 502);
        assert_eq!(Error::Dial("x".into()).status_code(), 502);
        assert_eq!(Error::UpstreamTransport("x".into()).status_code(), 502);
        assert_eq!(Error::Validation("x".into()).status_code(), 502);
    }

    #[test]
    fn test_passthrough_and_local_statuses() {
        assert_eq!(Error::UpstreamStatus { status: 410 }.status_code(), 410);
        assert_eq!(Error::Storage(io::Error::other("disk")).status_code(), 500);
        assert_eq!(Error::InvalidKey("..".into()).status_code(), 404);
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("a/@v/list".into()).is_not_found());
        assert!(!Error::Storage(io::Error::other("disk")).is_not_found());
    }
}
