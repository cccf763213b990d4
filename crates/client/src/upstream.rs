//! Upstream module-proxy fetcher.
//!
//! Joins the configured base URL with a cache key and issues one GET per
//! call through the shared [`Transport`]. Non-success statuses surface as
//! [`Error::UpstreamStatus`]; nothing here retries.

use std::time::Instant;

use bytes::Bytes;
use http::{Uri, header};
use http_body_util::BodyExt;
use hyper::body::Incoming;

use crate::transport::Transport;
use modcache_core::{CacheKey, Error};

/// Client for one upstream module proxy.
#[derive(Debug, Clone)]
pub struct Upstream {
    base: String,
    transport: Transport,
    user_agent: String,
}

/// Streaming upstream response body.
#[derive(Debug)]
pub struct UpstreamBody {
    body: Incoming,
    content_length: Option<u64>,
}

impl UpstreamBody {
    /// `Content-Length` announced by upstream, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Next data chunk, or `None` at end of body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        while let Some(frame) = self.body.frame().await {
            let frame = frame.map_err(|e| Error::UpstreamTransport(format!("failed to read response: {e}")))?;
            if let Ok(data) = frame.into_data()
                && !data.is_empty()
            {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }
}

impl Upstream {
    pub fn new(base: &str, transport: Transport, user_agent: impl Into<String>) -> Self {
        Self { base: base.trim_end_matches('/').to_string(), transport, user_agent: user_agent.into() }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `<base>/<key>`.
    pub fn url_for(&self, key: &CacheKey) -> Result<Uri, Error> {
        format!("{}/{}", self.base, key.as_str())
            .parse()
            .map_err(|e| Error::InvalidKey(format!("{key}: {e}")))
    }

    /// Issue the GET and check the status, leaving the body unread.
    pub async fn open(&self, key: &CacheKey) -> Result<UpstreamBody, Error> {
        let uri = self.url_for(key)?;
        let response = self.transport.get(uri.clone(), &self.user_agent).await.inspect_err(|e| {
            tracing::error!(url = %uri, error = %e, "upstream request failed");
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url = %uri, status = status.as_u16(), "upstream returned non-success status");
            return Err(Error::UpstreamStatus { status: status.as_u16() });
        }

        let content_length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        Ok(UpstreamBody { body: response.into_body(), content_length })
    }

    /// Fetch the whole body into memory.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Bytes, Error> {
        let start = Instant::now();
        let response = self.open(key).await?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| Error::UpstreamTransport(format!("failed to read response for {key}: {e}")))?
            .to_bytes();

        tracing::debug!(
            key = %key,
            bytes = bytes.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fetched from upstream"
        );
        Ok(bytes)
    }
}
