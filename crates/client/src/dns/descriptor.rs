//! Resolver descriptor parsing.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use super::ResolveError;

const DNS_PORT: u16 = 53;
const DOT_PORT: u16 = 853;

/// Immutable selection of one resolution strategy plus its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverDescriptor {
    /// Plain DNS over UDP; `server` is `host:port`.
    Udp { server: String },
    /// DNS-over-HTTPS JSON endpoint.
    Https { endpoint: String },
    /// DNS-over-TLS; `server_name` is the bare host used for SNI.
    Tls { server: String, server_name: String },
    /// DNS-over-QUIC descriptor, served through the DoT code path.
    Quic { server: String, server_name: String },
}

impl ResolverDescriptor {
    /// Parse a resolver configuration string.
    ///
    /// Returns `Ok(None)` for an empty string.
    pub fn parse(raw: &str) -> Result<Option<Self>, ResolveError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        if raw.starts_with("https://") {
            url::Url::parse(raw).map_err(|e| ResolveError::InvalidDescriptor(format!("{raw}: {e}")))?;
            return Ok(Some(Self::Https { endpoint: raw.to_string() }));
        }

        if let Some(rest) = raw.strip_prefix("quic://") {
            let (server, server_name) = with_default_port(rest, DOT_PORT)?;
            return Ok(Some(Self::Quic { server, server_name }));
        }

        if let Some(rest) = raw.strip_prefix("tls://") {
            let (server, server_name) = with_default_port(rest, DOT_PORT)?;
            return Ok(Some(Self::Tls { server, server_name }));
        }

        let rest = raw.strip_prefix("udp://").unwrap_or(raw);
        if rest.contains("://") {
            return Err(ResolveError::InvalidDescriptor(format!("unsupported scheme in {raw}")));
        }
        let (server, _) = with_default_port(rest, DNS_PORT)?;
        Ok(Some(Self::Udp { server }))
    }
}

/// Normalize `host[:port]` to `host:port`, returning it with the bare host.
fn with_default_port(input: &str, default_port: u16) -> Result<(String, String), ResolveError> {
    let input = input.trim_end_matches('/');
    if input.is_empty() {
        return Err(ResolveError::InvalidDescriptor("missing server address".into()));
    }

    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok((addr.to_string(), addr.ip().to_string()));
    }
    if let Ok(ip) = input.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok((SocketAddr::new(ip, default_port).to_string(), ip.to_string()));
    }

    match input.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| ResolveError::InvalidDescriptor(format!("invalid port in {input}")))?;
            if host.is_empty() {
                return Err(ResolveError::InvalidDescriptor(format!("missing host in {input}")));
            }
            Ok((format!("{host}:{port}"), host.to_string()))
        }
        None => Ok((format!("{input}:{default_port}"), input.to_string())),
    }
}

impl fmt::Display for ResolverDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp { server } => write!(f, "udp://{server}"),
            Self::Https { endpoint } => f.write_str(endpoint),
            Self::Tls { server, .. } => write!(f, "tls://{server}"),
            Self::Quic { server, .. } => write!(f, "quic://{server} (via DoT)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> ResolverDescriptor {
        ResolverDescriptor::parse(raw).unwrap().unwrap()
    }

    #[test]
    fn test_parse_empty() {
        assert!(ResolverDescriptor::parse("").unwrap().is_none());
    }

    #[test]
    fn test_parse_bare_ip_defaults_to_53() {
        assert_eq!(parse("8.8.8.8"), ResolverDescriptor::Udp { server: "8.8.8.8:53".into() });
    }

    #[test]
    fn test_parse_bare_ip_with_port() {
        assert_eq!(parse("8.8.4.4:5353"), ResolverDescriptor::Udp { server: "8.8.4.4:5353".into() });
    }

    #[test]
    fn test_parse_udp_scheme() {
        assert_eq!(parse("udp://9.9.9.9"), ResolverDescriptor::Udp { server: "9.9.9.9:53".into() });
        assert_eq!(parse("udp://dns.quad9.net:53"), ResolverDescriptor::Udp { server: "dns.quad9.net:53".into() });
    }

    #[test]
    fn test_parse_ipv6() {
        assert_eq!(
            parse("2001:4860:4860::8888"),
            ResolverDescriptor::Udp { server: "[2001:4860:4860::8888]:53".into() }
        );
        assert_eq!(parse("[2001:4860:4860::8888]:5353"), ResolverDescriptor::Udp {
            server: "[2001:4860:4860::8888]:5353".into()
        });
    }

    #[test]
    fn test_parse_tls_defaults_to_853() {
        assert_eq!(
            parse("tls://1.1.1.1"),
            ResolverDescriptor::Tls { server: "1.1.1.1:853".into(), server_name: "1.1.1.1".into() }
        );
    }

    #[test]
    fn test_parse_tls_hostname() {
        assert_eq!(
            parse("tls://dns.google:8853"),
            ResolverDescriptor::Tls { server: "dns.google:8853".into(), server_name: "dns.google".into() }
        );
    }

    #[test]
    fn test_parse_quic() {
        assert_eq!(
            parse("quic://dns.adguard-dns.com"),
            ResolverDescriptor::Quic {
                server: "dns.adguard-dns.com:853".into(),
                server_name: "dns.adguard-dns.com".into()
            }
        );
    }

    #[test]
    fn test_parse_https() {
        assert_eq!(
            parse("https://cloudflare-dns.com/dns-query"),
            ResolverDescriptor::Https { endpoint: "https://cloudflare-dns.com/dns-query".into() }
        );
    }

    #[test]
    fn test_parse_unknown_scheme() {
        assert!(matches!(
            ResolverDescriptor::parse("sdns://abc"),
            Err(ResolveError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_parse_bad_port() {
        assert!(matches!(ResolverDescriptor::parse("8.8.8.8:dns"), Err(ResolveError::InvalidDescriptor(_))));
        assert!(matches!(ResolverDescriptor::parse("tls://"), Err(ResolveError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(parse("tls://1.1.1.1").to_string(), "tls://1.1.1.1:853");
        assert_eq!(parse("8.8.8.8").to_string(), "udp://8.8.8.8:53");
    }
}
