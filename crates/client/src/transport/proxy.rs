//! Forward-proxy descriptors.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use url::Url;

/// Error type for proxy descriptor parsing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid proxy URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported proxy scheme: {0} (supported: http, https, socks5, socks5h)")]
    UnsupportedScheme(String),

    #[error("proxy URL has no host")]
    MissingHost,
}

/// Kind of forward proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Plain HTTP proxy: CONNECT for https targets, absolute-form for http.
    Http,
    /// HTTP proxy reached over TLS.
    Https,
    /// SOCKS5.
    Socks5,
    /// SOCKS5 with the hostname-forwarding scheme name.
    Socks5h,
}

impl ProxyKind {
    pub fn is_socks(self) -> bool {
        matches!(self, ProxyKind::Socks5 | ProxyKind::Socks5h)
    }

    fn scheme(self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Socks5h => "socks5h",
        }
    }
}

/// Immutable forward-proxy endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyDescriptor {
    /// Parse a proxy URL.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw.trim()).map_err(|e| ProxyError::InvalidUrl(format!("{raw}: {e}")))?;

        let kind = match url.scheme() {
            "http" => ProxyKind::Http,
            "https" => ProxyKind::Https,
            "socks5" => ProxyKind::Socks5,
            "socks5h" => ProxyKind::Socks5h,
            other => return Err(ProxyError::UnsupportedScheme(other.to_string())),
        };

        let host = url.host_str().filter(|h| !h.is_empty()).ok_or(ProxyError::MissingHost)?;
        let port = url.port_or_known_default().unwrap_or(1080);
        let username = Some(url.username()).filter(|u| !u.is_empty()).map(str::to_string);
        let password = url.password().map(str::to_string);

        Ok(Self { kind, host: host.to_string(), port, username, password })
    }

    /// Parse a configured proxy, degrading to `None` (direct dialing) on any error.
    pub fn from_config(raw: Option<&str>) -> Option<Self> {
        let raw = raw.map(str::trim).filter(|r| !r.is_empty())?;
        match Self::parse(raw) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring proxy configuration; dialing directly");
                None
            }
        }
    }

    /// `Proxy-Authorization` value for CONNECT, if credentials were given.
    pub fn basic_auth(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or("");
        Some(format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))))
    }
}

/// Credentials are never printed.
impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.kind.scheme(), self.host, self.port)
    }
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDescriptor")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}
