//! Outbound connection factory.
//!
//! Composes the optional resolver and the optional forward proxy into a
//! single dialing path:
//!
//! - direct: resolve (custom resolver if configured, first address) and connect
//! - `http://` / `https://` proxy: dial the proxy the same way, then CONNECT
//!   for https targets or hand back the proxy stream for http targets
//! - `socks5://` / `socks5h://`: dial the proxy, then SOCKS5; with a custom
//!   resolver the destination is resolved locally and sent as an IP literal
//!
//! TLS towards https targets is done here, after any tunnel is in place.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_socks::TargetAddr;
use tokio_socks::tcp::Socks5Stream;

use super::conn::{BoxedIo, OutboundConn};
use super::proxy::{ProxyDescriptor, ProxyKind};
use crate::dns::{ResolveError, Resolver};
use crate::tls;

use modcache_core::Error;

/// Largest CONNECT response head we accept.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Error type for outbound dialing.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("URI has no host: {0}")]
    MissingHost(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve { host: String, source: ResolveError },

    #[error("connect to {0} timed out")]
    Timeout(String),

    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("proxy CONNECT to {target} failed: {reason}")]
    Tunnel { target: String, reason: String },

    #[error("SOCKS5 handshake for {target} failed: {source}")]
    Socks { target: String, source: tokio_socks::Error },

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },
}

impl From<DialError> for Error {
    fn from(err: DialError) -> Self {
        match err {
            DialError::Resolve { .. } => Error::Resolution(err.to_string()),
            other => Error::Dial(other.to_string()),
        }
    }
}

/// Fixed dialing parameters.
#[derive(Debug, Clone, Copy)]
pub struct DialSettings {
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub keepalive: Duration,
}

impl DialSettings {
    /// Upper bound on one connection set-up, proxy steps and handshakes included.
    pub fn dial_budget(&self) -> Duration {
        self.connect_timeout + self.tls_handshake_timeout
    }
}

impl Default for DialSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(5),
            keepalive: Duration::from_secs(30),
        }
    }
}

struct DialerInner {
    resolver: Option<Resolver>,
    proxy: Option<ProxyDescriptor>,
    tls: TlsConnector,
    settings: DialSettings,
}

/// Shared, immutable connection factory.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<DialerInner>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("resolver", &self.inner.resolver.as_ref().map(|r| r.descriptor().to_string()))
            .field("proxy", &self.inner.proxy)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Dialer {
    pub fn new(
        resolver: Option<Resolver>, proxy: Option<ProxyDescriptor>, settings: DialSettings,
    ) -> Result<Self, DialError> {
        let tls = tls::connector().map_err(|e| DialError::Tls { host: "-".into(), reason: e.to_string() })?;
        Ok(Self { inner: Arc::new(DialerInner { resolver, proxy, tls, settings }) })
    }

    /// Open a TCP connection to `host:port`.
    ///
    /// With a custom resolver the first returned address is used and a
    /// lookup failure is final. Without one, system resolution applies.
    pub async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let deadline = Instant::now() + self.inner.settings.connect_timeout;
        let target = authority(host, port);

        let stream = tokio::time::timeout_at(deadline, self.open_tcp(host, port, deadline))
            .await
            .map_err(|_| DialError::Timeout(target.clone()))??;

        let keepalive = TcpKeepalive::new().with_time(self.inner.settings.keepalive);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(addr = %target, error = %e, "failed to enable TCP keep-alive");
        }
        let _ = stream.set_nodelay(true);

        Ok(stream)
    }

    async fn open_tcp(&self, host: &str, port: u16, deadline: Instant) -> Result<TcpStream, DialError> {
        match &self.inner.resolver {
            Some(resolver) => {
                let ip = self.resolve_first(resolver, host, deadline).await?;
                let addr = SocketAddr::new(ip, port);
                TcpStream::connect(addr).await.map_err(|source| DialError::Connect { addr: addr.to_string(), source })
            }
            None => {
                let bare = host.trim_start_matches('[').trim_end_matches(']');
                TcpStream::connect((bare, port))
                    .await
                    .map_err(|source| DialError::Connect { addr: authority(host, port), source })
            }
        }
    }

    async fn resolve_first(&self, resolver: &Resolver, host: &str, deadline: Instant) -> Result<IpAddr, DialError> {
        let ips = resolver
            .lookup(host, deadline)
            .await
            .map_err(|source| DialError::Resolve { host: host.to_string(), source })?;
        ips.first().copied().ok_or_else(|| DialError::Resolve {
            host: host.to_string(),
            source: ResolveError::NoRecords(host.to_string()),
        })
    }

    /// Establish a connection suitable for sending a request to `uri`.
    pub async fn connect(&self, uri: &Uri) -> Result<OutboundConn, DialError> {
        let host = uri.host().ok_or_else(|| DialError::MissingHost(uri.to_string()))?;
        let https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let Some(proxy) = &self.inner.proxy else {
            let tcp = self.dial_tcp(host, port).await?;
            return self.finish(Box::new(tcp), host, https).await;
        };

        let tcp = self.dial_tcp(&proxy.host, proxy.port).await?;

        match proxy.kind {
            ProxyKind::Http | ProxyKind::Https => {
                let io: BoxedIo = match proxy.kind {
                    ProxyKind::Https => Box::new(self.tls_handshake(Box::new(tcp), &proxy.host).await?),
                    _ => Box::new(tcp),
                };
                if !https {
                    return Ok(OutboundConn::new(io, true));
                }
                let tunnel = connect_tunnel(io, host, port, proxy.basic_auth().as_deref()).await?;
                self.finish(tunnel, host, true).await
            }
            ProxyKind::Socks5 | ProxyKind::Socks5h => {
                let target = match &self.inner.resolver {
                    Some(resolver) => {
                        let deadline = Instant::now() + self.inner.settings.connect_timeout;
                        let ip = self.resolve_first(resolver, host, deadline).await?;
                        TargetAddr::Ip(SocketAddr::new(ip, port))
                    }
                    None => TargetAddr::Domain(host.trim_start_matches('[').trim_end_matches(']').to_string().into(), port),
                };
                let stream = self.socks5_handshake(tcp, target, proxy, host).await?;
                self.finish(Box::new(stream), host, https).await
            }
        }
    }

    async fn socks5_handshake(
        &self, tcp: TcpStream, target: TargetAddr<'static>, proxy: &ProxyDescriptor, host: &str,
    ) -> Result<Socks5Stream<TcpStream>, DialError> {
        let handshake = async {
            match proxy.username.as_deref() {
                Some(username) => {
                    let password = proxy.password.as_deref().unwrap_or("");
                    Socks5Stream::connect_with_password_and_socket(tcp, target, username, password).await
                }
                None => Socks5Stream::connect_with_socket(tcp, target).await,
            }
        };

        tokio::time::timeout(self.inner.settings.connect_timeout, handshake)
            .await
            .map_err(|_| DialError::Timeout(format!("socks5 {proxy}")))?
            .map_err(|source| DialError::Socks { target: host.to_string(), source })
    }

    async fn tls_handshake(
        &self, io: BoxedIo, host: &str,
    ) -> Result<tokio_rustls::client::TlsStream<BoxedIo>, DialError> {
        let server_name =
            tls::server_name(host).map_err(|e| DialError::Tls { host: host.to_string(), reason: e.to_string() })?;

        tokio::time::timeout(self.inner.settings.tls_handshake_timeout, self.inner.tls.connect(server_name, io))
            .await
            .map_err(|_| DialError::Tls { host: host.to_string(), reason: "handshake timed out".into() })?
            .map_err(|e| DialError::Tls { host: host.to_string(), reason: e.to_string() })
    }

    /// Wrap in TLS for https targets; plain otherwise.
    async fn finish(&self, io: BoxedIo, host: &str, https: bool) -> Result<OutboundConn, DialError> {
        if https {
            let tls = self.tls_handshake(io, host).await?;
            Ok(OutboundConn::new(Box::new(tls), false))
        } else {
            Ok(OutboundConn::new(io, false))
        }
    }
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') { format!("[{host}]:{port}") } else { format!("{host}:{port}") }
}

/// Issue `CONNECT host:port` over `io` and wait for a 200.
async fn connect_tunnel(mut io: BoxedIo, host: &str, port: u16, auth: Option<&str>) -> Result<BoxedIo, DialError> {
    let target = authority(host, port);
    let tunnel_err = |reason: String| DialError::Tunnel { target: target.clone(), reason };

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = auth {
        request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");
    io.write_all(request.as_bytes()).await.map_err(|e| tunnel_err(e.to_string()))?;
    io.flush().await.map_err(|e| tunnel_err(e.to_string()))?;

    // Byte at a time so nothing past the response head is consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(tunnel_err("response head too large".into()));
        }
        let n = io.read(&mut byte).await.map_err(|e| tunnel_err(e.to_string()))?;
        if n == 0 {
            return Err(tunnel_err("proxy closed the connection".into()));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some("200") => Ok(io),
        _ => Err(tunnel_err(format!("proxy answered {status_line:?}"))),
    }
}

impl tower_service::Service<Uri> for Dialer {
    type Response = OutboundConn;
    type Error = DialError;
    type Future = Pin<Box<dyn Future<Output = Result<OutboundConn, DialError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.clone();
        Box::pin(async move {
            let budget = dialer.inner.settings.dial_budget();
            tokio::time::timeout(budget, dialer.connect(&uri))
                .await
                .map_err(|_| DialError::Timeout(uri.to_string()))?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsResolver, ResolverDescriptor};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// Resolver answering every name with one address and recording the names asked.
    #[derive(Debug, Default)]
    struct Recording {
        answer: Option<IpAddr>,
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DnsResolver for Recording {
        async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
            self.asked.lock().unwrap().push(host.to_string());
            self.answer.map(|ip| vec![ip]).ok_or_else(|| ResolveError::NoRecords(host.to_string()))
        }
    }

    fn resolver_with(strategy: Arc<Recording>) -> Resolver {
        Resolver::from_strategy(ResolverDescriptor::Udp { server: "127.0.0.1:53".into() }, strategy)
    }

    fn dialer(resolver: Option<Resolver>, proxy: Option<&str>) -> Dialer {
        let proxy = proxy.map(|p| ProxyDescriptor::parse(p).unwrap());
        Dialer::new(resolver, proxy, DialSettings::default()).unwrap()
    }

    async fn echo_listener() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_dial_direct_with_custom_resolver() {
        let addr = echo_listener().await;
        let strategy = Arc::new(Recording { answer: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), ..Default::default() });
        let d = dialer(Some(resolver_with(Arc::clone(&strategy))), None);

        let mut stream = d.dial_tcp("proxy.golang.org", addr.port()).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"ping");
        assert_eq!(strategy.asked.lock().unwrap().as_slice(), ["proxy.golang.org"]);
    }

    #[tokio::test]
    async fn test_resolution_failure_is_final() {
        let strategy = Arc::new(Recording::default());
        let d = dialer(Some(resolver_with(strategy)), None);

        let result = d.dial_tcp("localhost", 80).await;
        assert!(matches!(result, Err(DialError::Resolve { .. })));
        assert!(matches!(Error::from(result.unwrap_err()), Error::Resolution(_)));
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = dialer(None, None).dial_tcp("127.0.0.1", port).await;
        assert!(matches!(result, Err(DialError::Connect { .. })));
        assert!(matches!(Error::from(result.unwrap_err()), Error::Dial(_)));
    }

    #[tokio::test]
    async fn test_http_proxy_plain_target_is_proxied() {
        let proxy_addr = echo_listener().await;
        let d = dialer(None, Some(&format!("http://{proxy_addr}")));

        let conn = d.connect(&"http://proxy.golang.org/example.com/@v/list".parse().unwrap()).await.unwrap();
        assert!(conn.is_proxied());
    }

    #[tokio::test]
    async fn test_connect_tunnel_sends_request_and_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                sock.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\ntunnelled").await.unwrap();
            String::from_utf8(head).unwrap()
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut io = connect_tunnel(Box::new(tcp), "proxy.golang.org", 443, Some("Basic YTpi")).await.unwrap();
        let mut rest = [0u8; 9];
        io.read_exact(&mut rest).await.unwrap();

        let head = proxy.await.unwrap();
        assert!(head.starts_with("CONNECT proxy.golang.org:443 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic YTpi\r\n"));
        assert_eq!(&rest, b"tunnelled");
    }

    #[tokio::test]
    async fn test_connect_tunnel_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = sock.read(&mut buf).await;
            let _ = sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let result = connect_tunnel(Box::new(tcp), "proxy.golang.org", 443, None).await;
        assert!(matches!(result, Err(DialError::Tunnel { reason, .. }) if reason.contains("407")));
    }

    #[tokio::test]
    async fn test_silent_proxy_is_bounded_by_dial_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let settings = DialSettings {
            connect_timeout: Duration::from_millis(100),
            tls_handshake_timeout: Duration::from_millis(100),
            keepalive: Duration::from_secs(30),
        };
        let proxy = ProxyDescriptor::parse(&format!("http://{addr}")).unwrap();
        let mut d = Dialer::new(None, Some(proxy), settings).unwrap();

        let started = std::time::Instant::now();
        let result = tower_service::Service::call(&mut d, "https://proxy.golang.org/".parse().unwrap()).await;
        assert!(matches!(result, Err(DialError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// Minimal no-auth SOCKS5 server: records the requested target, then echoes.
    async fn socks5_server() -> (SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 2];
            sock.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            sock.read_exact(&mut methods).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 4];
            sock.read_exact(&mut header).await.unwrap();
            let mut target = vec![header[3]];
            match header[3] {
                0x01 => {
                    let mut rest = [0u8; 6];
                    sock.read_exact(&mut rest).await.unwrap();
                    target.extend_from_slice(&rest);
                }
                0x03 => {
                    let len = sock.read_u8().await.unwrap();
                    let mut rest = vec![0u8; len as usize + 2];
                    sock.read_exact(&mut rest).await.unwrap();
                    target.push(len);
                    target.extend_from_slice(&rest);
                }
                _ => panic!("unexpected address type"),
            }
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 80]).await.unwrap();
            let _ = tx.send(target);

            let (mut r, mut w) = sock.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_socks5_with_custom_resolver_sends_ip() {
        let (proxy_addr, target) = socks5_server().await;
        let strategy = Arc::new(Recording { answer: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 44))), ..Default::default() });
        let d = dialer(Some(resolver_with(Arc::clone(&strategy))), Some(&format!("socks5://{proxy_addr}")));

        let conn = d.connect(&"http://proxy.golang.org/example.com/@v/list".parse().unwrap()).await.unwrap();
        assert!(!conn.is_proxied());

        let target = target.await.unwrap();
        assert_eq!(target, vec![0x01, 192, 0, 2, 44, 0, 80]);
        assert!(strategy.asked.lock().unwrap().contains(&"proxy.golang.org".to_string()));
    }

    #[tokio::test]
    async fn test_socks5_without_resolver_sends_hostname() {
        let (proxy_addr, target) = socks5_server().await;
        let d = dialer(None, Some(&format!("socks5h://{proxy_addr}")));

        d.connect(&"http://proxy.golang.org/example.com/@v/list".parse().unwrap()).await.unwrap();

        let target = target.await.unwrap();
        let mut expected = vec![0x03, 16];
        expected.extend_from_slice(b"proxy.golang.org");
        expected.extend_from_slice(&80u16.to_be_bytes());
        assert_eq!(target, expected);
    }

    #[test]
    fn test_authority_brackets_ipv6() {
        assert_eq!(authority("::1", 443), "[::1]:443");
        assert_eq!(authority("[::1]", 443), "[::1]:443");
        assert_eq!(authority("proxy.golang.org", 443), "proxy.golang.org:443");
    }
}
