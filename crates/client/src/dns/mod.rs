//! Pluggable name resolution.
//!
//! ### Descriptor dispatch
//! One configuration string selects the strategy by prefix:
//! - `udp://host:port` or bare `host[:port]`: plain DNS over UDP (default port 53)
//! - `https://...`: DNS-over-HTTPS, JSON answer format
//! - `tls://host[:port]`: DNS-over-TLS (default port 853)
//! - `quic://host[:port]`: DNS-over-QUIC is not spoken; the DoT code path is
//!   used against the same server, and a warning says so at construction
//! - empty: no resolver, system resolution applies
//!
//! ### Deadlines
//! Every lookup runs against a caller-supplied deadline. When it passes the
//! in-flight query is dropped and `ResolveError::Timeout` is returned.

pub mod descriptor;
pub mod doh;
pub mod dot;
pub mod udp;
pub mod wire;

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

pub use descriptor::ResolverDescriptor;
pub use doh::DohResolver;
pub use dot::DotResolver;
pub use udp::UdpResolver;

use modcache_core::Error;

/// Error type for name resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid resolver descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("resolution of {0} timed out")]
    Timeout(String),

    #[error("no address records found for {0}")]
    NoRecords(String),

    #[error("DNS protocol error: {0}")]
    Protocol(String),

    #[error("DoH request failed: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        Error::Resolution(err.to_string())
    }
}

/// One DNS transport.
#[async_trait]
pub trait DnsResolver: Send + Sync + fmt::Debug {
    /// Resolve `host` into an ordered list of addresses.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// The process-wide resolver: one strategy plus the descriptor it came from.
///
/// Cheap to clone and read-only after construction.
#[derive(Clone, Debug)]
pub struct Resolver {
    descriptor: ResolverDescriptor,
    inner: Arc<dyn DnsResolver>,
}

impl Resolver {
    /// Build the strategy named by `descriptor`.
    pub fn new(descriptor: ResolverDescriptor) -> Result<Self, ResolveError> {
        let inner: Arc<dyn DnsResolver> = match &descriptor {
            ResolverDescriptor::Udp { server } => Arc::new(UdpResolver::new(server.clone())),
            ResolverDescriptor::Https { endpoint } => Arc::new(DohResolver::new(endpoint.clone())?),
            ResolverDescriptor::Tls { server, server_name } => {
                Arc::new(DotResolver::new(server.clone(), server_name)?)
            }
            ResolverDescriptor::Quic { server, server_name } => {
                tracing::warn!(%server, "DNS-over-QUIC is not implemented; using DNS-over-TLS against the same server");
                Arc::new(DotResolver::new(server.clone(), server_name)?)
            }
        };
        Ok(Self { descriptor, inner })
    }

    /// Wrap an arbitrary strategy.
    pub fn from_strategy(descriptor: ResolverDescriptor, inner: Arc<dyn DnsResolver>) -> Self {
        Self { descriptor, inner }
    }

    pub fn descriptor(&self) -> &ResolverDescriptor {
        &self.descriptor
    }

    /// Resolve `host`, giving up at `deadline`.
    ///
    /// IP literals (bracketed or not) are returned as-is without a query.
    pub async fn lookup(&self, host: &str, deadline: Instant) -> Result<Vec<IpAddr>, ResolveError> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let ips = tokio::time::timeout_at(deadline, self.inner.lookup_ip(bare))
            .await
            .map_err(|_| ResolveError::Timeout(bare.to_string()))??;

        tracing::debug!(host = bare, resolver = %self.descriptor, answers = ips.len(), "resolved");
        Ok(ips)
    }
}

/// Build the resolver named by a configuration string.
///
/// An empty string yields `Ok(None)`: system resolution applies.
pub fn build_resolver(raw: &str) -> Result<Option<Resolver>, ResolveError> {
    match ResolverDescriptor::parse(raw)? {
        Some(descriptor) => Ok(Some(Resolver::new(descriptor)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[derive(Debug)]
    struct Fixed(Vec<IpAddr>);

    #[async_trait]
    impl DnsResolver for Fixed {
        async fn lookup_ip(&self, _host: &str) -> Result<Vec<IpAddr>, ResolveError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct Hang;

    #[async_trait]
    impl DnsResolver for Hang {
        async fn lookup_ip(&self, _host: &str) -> Result<Vec<IpAddr>, ResolveError> {
            std::future::pending().await
        }
    }

    fn udp_descriptor() -> ResolverDescriptor {
        ResolverDescriptor::Udp { server: "127.0.0.1:53".into() }
    }

    #[test]
    fn test_build_resolver_empty() {
        assert!(build_resolver("").unwrap().is_none());
        assert!(build_resolver("   ").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_build_resolver_udp() {
        let resolver = build_resolver("8.8.8.8").unwrap().unwrap();
        assert_eq!(resolver.descriptor(), &ResolverDescriptor::Udp { server: "8.8.8.8:53".into() });
    }

    #[tokio::test]
    async fn test_build_resolver_tls() {
        let resolver = build_resolver("tls://1.1.1.1").unwrap().unwrap();
        assert_eq!(
            resolver.descriptor(),
            &ResolverDescriptor::Tls { server: "1.1.1.1:853".into(), server_name: "1.1.1.1".into() }
        );
    }

    #[tokio::test]
    async fn test_ip_literal_skips_query() {
        let resolver = Resolver::from_strategy(udp_descriptor(), Arc::new(Hang));
        let deadline = Instant::now() + Duration::from_millis(50);
        let ips = resolver.lookup("10.0.0.7", deadline).await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]);

        let ips = resolver.lookup("[::1]", deadline).await.unwrap();
        assert_eq!(ips, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_lookup_uses_strategy() {
        let answer = vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))];
        let resolver = Resolver::from_strategy(udp_descriptor(), Arc::new(Fixed(answer.clone())));
        let ips = resolver
            .lookup("example.com", Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ips, answer);
    }

    #[tokio::test]
    async fn test_lookup_deadline() {
        let resolver = Resolver::from_strategy(udp_descriptor(), Arc::new(Hang));
        let result = resolver
            .lookup("example.com", Instant::now() + Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(ResolveError::Timeout(host)) if host == "example.com"));
    }

    #[test]
    fn test_resolve_error_maps_to_resolution() {
        let err: Error = ResolveError::NoRecords("example.com".into()).into();
        assert!(matches!(err, Error::Resolution(_)));
        assert_eq!(err.status_code(), 502);
    }
}
