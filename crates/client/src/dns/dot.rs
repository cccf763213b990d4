//! DNS-over-TLS.
//!
//! One query per connection, framed with a two-byte big-endian length
//! prefix in both directions. Also serves `quic://` descriptors.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use super::{DnsResolver, ResolveError, wire};
use crate::tls;

/// Connect timeout towards the DoT server.
const DOT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolver speaking DNS-over-TLS to one server.
#[derive(Clone)]
pub struct DotResolver {
    server: String,
    server_name: ServerName<'static>,
    tls: TlsConnector,
}

impl std::fmt::Debug for DotResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DotResolver")
            .field("server", &self.server)
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl DotResolver {
    /// `server` is `host:port`; `server_name` is the bare host used for SNI.
    pub fn new(server: String, server_name: &str) -> Result<Self, ResolveError> {
        let server_name = tls::server_name(server_name).map_err(|e| ResolveError::Tls(e.to_string()))?;
        let tls = tls::connector().map_err(|e| ResolveError::Tls(e.to_string()))?;
        Ok(Self { server, server_name, tls })
    }
}

/// Write one framed query and read one framed reply.
pub(crate) async fn exchange<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>, ResolveError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len()).map_err(|_| ResolveError::Protocol("query too large".into()))?;
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;
    stream.flush().await?;

    let reply_len = stream.read_u16().await? as usize;
    let mut reply = vec![0u8; reply_len];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}

#[async_trait]
impl DnsResolver for DotResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let tcp = tokio::time::timeout(DOT_CONNECT_TIMEOUT, TcpStream::connect(self.server.as_str()))
            .await
            .map_err(|_| ResolveError::Timeout(self.server.clone()))??;
        let mut stream = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| ResolveError::Tls(e.to_string()))?;

        let (id, query) = wire::build_query(host, RecordType::A)?;
        let reply = exchange(&mut stream, &query).await?;
        let ips = wire::parse_reply(&reply, id)?;

        if ips.is_empty() {
            return Err(ResolveError::NoRecords(host.to_string()));
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_new_with_ip_server_name() {
        let resolver = DotResolver::new("1.1.1.1:853".into(), "1.1.1.1").unwrap();
        assert!(matches!(resolver.server_name, ServerName::IpAddress(_)));
    }

    #[test]
    fn test_new_rejects_bad_server_name() {
        assert!(matches!(DotResolver::new("x:853".into(), "bad name"), Err(ResolveError::Tls(_))));
    }

    #[tokio::test]
    async fn test_exchange_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let (id, query) = wire::build_query("example.com", RecordType::A).unwrap();

        let server_task = tokio::spawn(async move {
            let len = server.read_u16().await.unwrap() as usize;
            let mut received = vec![0u8; len];
            server.read_exact(&mut received).await.unwrap();

            let reply = wire::answer(&received, &[IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))]);
            server.write_u16(reply.len() as u16).await.unwrap();
            server.write_all(&reply).await.unwrap();
        });

        let reply = exchange(&mut client, &query).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(wire::parse_reply(&reply, id).unwrap(), vec![IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))]);
    }

    #[tokio::test]
    async fn test_exchange_truncated_reply() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let (_, query) = wire::build_query("example.com", RecordType::A).unwrap();

        tokio::spawn(async move {
            let mut sink = vec![0u8; 2 + query.len()];
            server.read_exact(&mut sink).await.unwrap();
            server.write_u16(64).await.unwrap();
            server.write_all(b"short").await.unwrap();
        });

        let (_, query) = wire::build_query("example.com", RecordType::A).unwrap();
        let result = exchange(&mut client, &query).await;
        assert!(matches!(result, Err(ResolveError::Io(_))));
    }
}
