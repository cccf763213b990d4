//! Pooled outbound HTTP transport.
//!
//! One [`Transport`] is built at startup and shared by every request. It owns
//! a keep-alive connection pool whose connections come from the [`Dialer`].
//!
//! ### Limits
//! - connect (resolution included): 5 s
//! - TLS handshake: 5 s
//! - response headers: 10 s, counted after the connection is set up
//! - redirects: at most 10 hops, each through the same pool
//! - idle pooled connections: closed after 90 s, at most 10 per host
//! - TCP keep-alive: 30 s
//!
//! The pool has no global idle cap; [`MAX_IDLE_CONNS`] is the intended
//! process-wide figure and is only reported at startup.

pub mod conn;
pub mod dialer;
pub mod proxy;

use std::error::Error as StdError;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode, Uri, header};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use url::Url;

pub use conn::OutboundConn;
pub use dialer::{DialError, DialSettings, Dialer};
pub use proxy::{ProxyDescriptor, ProxyError, ProxyKind};

use crate::dns::Resolver;
use modcache_core::Error;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
pub const MAX_IDLE_PER_HOST: usize = 10;
pub const MAX_IDLE_CONNS: usize = 100;
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
pub const MAX_REDIRECTS: usize = 10;

/// Shared HTTP client for upstream requests.
#[derive(Clone, Debug)]
pub struct Transport {
    client: Client<Dialer, Empty<Bytes>>,
    /// Sent on plain-http requests, which reach an HTTP proxy in absolute form.
    proxy_auth: Option<HeaderValue>,
    dial_budget: Duration,
    header_timeout: Duration,
}

impl Transport {
    /// Build the transport from the optional resolver and proxy.
    pub fn build(resolver: Option<Resolver>, proxy: Option<ProxyDescriptor>) -> Result<Self, Error> {
        let settings = DialSettings {
            connect_timeout: CONNECT_TIMEOUT,
            tls_handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
            keepalive: TCP_KEEPALIVE,
        };
        Self::build_with(resolver, proxy, settings)
    }

    /// Same as [`Transport::build`] with explicit dial settings.
    pub fn build_with(
        resolver: Option<Resolver>, proxy: Option<ProxyDescriptor>, settings: DialSettings,
    ) -> Result<Self, Error> {
        let proxy_auth = proxy
            .as_ref()
            .filter(|p| matches!(p.kind, ProxyKind::Http | ProxyKind::Https))
            .and_then(ProxyDescriptor::basic_auth)
            .and_then(|auth| HeaderValue::from_str(&auth).ok());

        let dialer = Dialer::new(resolver, proxy, settings)?;

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build(dialer);

        Ok(Self { client, proxy_auth, dial_budget: settings.dial_budget(), header_timeout: RESPONSE_HEADER_TIMEOUT })
    }

    /// Override the response-header timeout.
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Send a GET, follow redirects, and wait for the final response head.
    ///
    /// The body is left unread so callers can stream it.
    pub async fn get(&self, uri: Uri, user_agent: &str) -> Result<Response<Incoming>, Error> {
        let mut uri = uri;
        for hop in 0..=MAX_REDIRECTS {
            let response = self.send(&uri, user_agent).await?;
            if !is_redirect(response.status()) {
                return Ok(response);
            }
            let Some(location) = response.headers().get(header::LOCATION) else {
                return Ok(response);
            };
            if hop == MAX_REDIRECTS {
                break;
            }

            let next = redirect_target(&uri, location)?;
            tracing::debug!(from = %uri, to = %next, status = response.status().as_u16(), "following redirect");
            uri = next;
        }
        Err(Error::UpstreamTransport(format!("{uri}: stopped after {MAX_REDIRECTS} redirects")))
    }

    /// One request on the pool.
    ///
    /// The dialer bounds connection set-up on its own, so the outer timeout
    /// is that budget plus the header timeout. A slow dial therefore surfaces
    /// as a dial error, not as a header timeout.
    async fn send(&self, uri: &Uri, user_agent: &str) -> Result<Response<Incoming>, Error> {
        let mut builder = Request::get(uri.clone()).header(header::USER_AGENT, user_agent);
        if let Some(auth) = self.proxy_auth.as_ref().filter(|_| uri.scheme_str() != Some("https")) {
            builder = builder.header(header::PROXY_AUTHORIZATION, auth.clone());
        }
        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::UpstreamTransport(format!("failed to build request for {uri}: {e}")))?;

        match tokio::time::timeout(self.dial_budget + self.header_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(classify(uri, &e)),
            Err(_) => Err(Error::UpstreamTransport(format!("timed out waiting for response headers from {uri}"))),
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Resolve `Location` against the URI that produced it.
fn redirect_target(current: &Uri, location: &HeaderValue) -> Result<Uri, Error> {
    let invalid = |reason: String| Error::UpstreamTransport(format!("{current}: bad redirect: {reason}"));

    let location = location.to_str().map_err(|e| invalid(e.to_string()))?;
    let base = Url::parse(&current.to_string()).map_err(|e| invalid(e.to_string()))?;
    let next = base.join(location).map_err(|e| invalid(format!("{location}: {e}")))?;
    if !matches!(next.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme in {next}")));
    }
    next.as_str().parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))
}

/// Map a client error onto the service taxonomy.
///
/// Connect-phase failures carry the [`DialError`] in their source chain.
fn classify(uri: &Uri, err: &hyper_util::client::legacy::Error) -> Error {
    if err.is_connect() {
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(dial) = cause.downcast_ref::<DialError>() {
                return match dial {
                    DialError::Resolve { .. } => Error::Resolution(dial.to_string()),
                    other => Error::Dial(other.to_string()),
                };
            }
            source = cause.source();
        }
        return Error::Dial(format!("{uri}: {err}"));
    }
    Error::UpstreamTransport(format!("{uri}: {}", error_chain(err)))
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
