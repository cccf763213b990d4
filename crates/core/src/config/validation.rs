//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from flags, environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// Proxy and resolver strings are deliberately not validated here: a bad
    /// value degrades to direct dialing or system resolution instead of
    /// failing startup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `port` is 0
    /// - `upstream` is not an absolute http(s) URL
    /// - either timeout is below 100ms
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid { field: "port".into(), reason: "must be greater than 0".into() });
        }

        let upstream = url::Url::parse(&self.upstream)
            .map_err(|e| ConfigError::Invalid { field: "upstream".into(), reason: e.to_string() })?;
        if !matches!(upstream.scheme(), "http" | "https") || upstream.host_str().is_none() {
            return Err(ConfigError::Invalid {
                field: "upstream".into(),
                reason: "must be an absolute http:// or https:// URL".into(),
            });
        }

        if self.request_timeout_ms < 100 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms".into(),
                reason: "must be at least 100ms".into(),
            });
        }
        if self.archive_timeout_ms < 100 {
            return Err(ConfigError::Invalid {
                field: "archive_timeout_ms".into(),
                reason: "must be at least 100ms".into(),
            });
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        if self.archive_timeout_ms < self.request_timeout_ms {
            tracing::warn!(
                archive_timeout_ms = self.archive_timeout_ms,
                request_timeout_ms = self.request_timeout_ms,
                "archive timeout is shorter than the buffered request timeout"
            );
        }

        Ok(())
    }
}
