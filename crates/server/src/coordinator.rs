//! Fetch-and-cache coordinator.
//!
//! Per request: look the key up in the disk cache, serve it on a hit, and on
//! a miss fetch from upstream, validate, persist and serve. Nothing is retried
//! and concurrent misses on one key are not coalesced; each fetches on its own
//! and the last rename wins with identical content.
//!
//! List, info and mod bodies are small and buffered. Archives are streamed:
//! every upstream chunk goes to the client and to a staged temp file, which is
//! renamed into place only once the upstream body has ended cleanly.

use std::io;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use modcache_client::Upstream;
use modcache_core::{CacheKey, DiskCache, Error};

/// Read size when streaming a cached archive.
const STREAM_CHUNK: usize = 64 * 1024;

/// One of the four module-proxy request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    List,
    Info,
    Mod,
    Zip,
}

impl Verb {
    /// Pick the verb from the request path suffix.
    pub fn from_path(path: &str) -> Option<Self> {
        if path.ends_with("/@v/list") {
            Some(Verb::List)
        } else if path.ends_with(".info") {
            Some(Verb::Info)
        } else if path.ends_with(".mod") {
            Some(Verb::Mod)
        } else if path.ends_with(".zip") {
            Some(Verb::Zip)
        } else {
            None
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Verb::List | Verb::Mod => "text/plain; charset=utf-8",
            Verb::Info => "application/json",
            Verb::Zip => "application/zip",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::List => "list",
            Verb::Info => "info",
            Verb::Mod => "mod",
            Verb::Zip => "zip",
        }
    }
}

/// Shared per-process request handler state.
#[derive(Debug, Clone)]
pub struct Coordinator {
    cache: DiskCache,
    upstream: Upstream,
    request_timeout: Duration,
    archive_timeout: Duration,
}

impl Coordinator {
    pub fn new(cache: DiskCache, upstream: Upstream, request_timeout: Duration, archive_timeout: Duration) -> Self {
        Self { cache, upstream, request_timeout, archive_timeout }
    }

    /// Serve `key` for `verb`.
    pub async fn serve(&self, verb: Verb, key: CacheKey) -> Result<Response, Error> {
        match verb {
            Verb::Zip => self.archive(key).await,
            _ => {
                let body = self.buffered(verb, &key).await?;
                Ok(([(header::CONTENT_TYPE, verb.content_type())], body).into_response())
            }
        }
    }

    /// Lookup-or-fetch for list, info and mod.
    pub async fn buffered(&self, verb: Verb, key: &CacheKey) -> Result<Bytes, Error> {
        match self.cache.read(key).await {
            Ok(body) => {
                tracing::debug!(key = %key, verb = verb.as_str(), bytes = body.len(), "cache hit");
                return Ok(body);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        tracing::info!(key = %key, verb = verb.as_str(), "cache miss, fetching from upstream");
        let body = tokio::time::timeout(self.request_timeout, self.upstream.fetch(key))
            .await
            .map_err(|_| Error::UpstreamTransport(format!("upstream fetch for {key} timed out")))??;

        if verb == Verb::Info {
            validate_info(&body)?;
        }

        if let Err(e) = self.cache.write(key, &body).await {
            tracing::warn!(key = %key, error = %e, "failed to cache upstream response");
        }

        Ok(body)
    }

    /// Lookup-or-stream for archives.
    async fn archive(&self, key: CacheKey) -> Result<Response, Error> {
        match self.cache.open_reader(&key).await {
            Ok((file, len)) => {
                tracing::debug!(key = %key, verb = "zip", bytes = len, "cache hit");
                let mut headers = zip_headers();
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                return Ok((StatusCode::OK, headers, file_body(file)).into_response());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        tracing::info!(key = %key, verb = "zip", "cache miss, streaming from upstream");
        let deadline = tokio::time::Instant::now() + self.archive_timeout;
        let mut upstream = tokio::time::timeout_at(deadline, self.upstream.open(&key))
            .await
            .map_err(|_| Error::UpstreamTransport(format!("upstream fetch for {key} timed out")))??;

        let staged = match self.cache.stage(&key).await {
            Ok(staged) => Some(staged),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cannot stage archive; serving without caching");
                None
            }
        };

        let mut headers = zip_headers();
        if let Some(len) = upstream.content_length() {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }

        let stream = async_stream::stream! {
            let started = Instant::now();
            let mut staged = staged;
            let mut sent: u64 = 0;

            loop {
                let next = match tokio::time::timeout_at(deadline, upstream.chunk()).await {
                    Ok(next) => next,
                    Err(_) => Err(Error::UpstreamTransport(format!("archive fetch for {key} timed out"))),
                };

                match next {
                    Ok(Some(chunk)) => {
                        let failed = match staged.as_mut() {
                            Some(writer) => writer.write(&chunk).await.err(),
                            None => None,
                        };
                        if let Some(e) = failed {
                            tracing::warn!(key = %key, error = %e, "archive cache write failed; continuing without caching");
                            staged = None;
                        }
                        sent += chunk.len() as u64;
                        yield Ok::<_, io::Error>(chunk);
                    }
                    Ok(None) => {
                        if let Some(writer) = staged.take() {
                            match writer.commit().await {
                                Ok(_) => tracing::debug!(key = %key, "archive cached"),
                                Err(e) => tracing::warn!(key = %key, error = %e, "failed to cache archive"),
                            }
                        }
                        tracing::info!(
                            key = %key,
                            bytes = sent,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "archive streamed"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::error!(key = %key, bytes = sent, error = %e, "archive stream aborted");
                        yield Err(io::Error::other(e.to_string()));
                        break;
                    }
                }
            }
        };

        Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
    }
}

fn zip_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(Verb::Zip.content_type()));
    headers
}

/// Info bodies must be a JSON object.
fn validate_info(body: &[u8]) -> Result<(), Error> {
    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(body)
        .map(|_| ())
        .map_err(|_| Error::Validation("Invalid JSON".into()))
}

/// Stream a cached file as a response body.
fn file_body(mut file: tokio::fs::File) -> Body {
    Body::from_stream(async_stream::stream! {
        loop {
            let mut buf = BytesMut::with_capacity(STREAM_CHUNK);
            match file.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => yield Ok::<_, io::Error>(buf.freeze()),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}
