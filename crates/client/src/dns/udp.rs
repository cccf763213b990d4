//! Plain DNS over UDP.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use tokio::net::UdpSocket;

use super::{DnsResolver, ResolveError, wire};

/// Largest reply we accept over UDP.
const MAX_UDP_REPLY: usize = 4096;

/// Standard DNS resolver talking UDP to one server.
#[derive(Debug, Clone)]
pub struct UdpResolver {
    server: String,
}

impl UdpResolver {
    /// `server` is `host:port`.
    pub fn new(server: String) -> Self {
        Self { server }
    }

    async fn server_addr(&self) -> Result<SocketAddr, ResolveError> {
        if let Ok(addr) = self.server.parse::<SocketAddr>() {
            return Ok(addr);
        }
        tokio::net::lookup_host(self.server.as_str())
            .await?
            .next()
            .ok_or_else(|| ResolveError::NoRecords(self.server.clone()))
    }

    async fn query(&self, server: SocketAddr, host: &str, record_type: RecordType) -> Result<Vec<IpAddr>, ResolveError> {
        let bind: SocketAddr = if server.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { ([0u16; 8], 0).into() };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;

        let (id, query) = wire::build_query(host, record_type)?;
        socket.send(&query).await?;

        let mut buf = vec![0u8; MAX_UDP_REPLY];
        loop {
            let len = socket.recv(&mut buf).await?;
            match wire::parse_reply(&buf[..len], id) {
                Ok(ips) => return Ok(ips),
                // Stray datagrams are dropped; the caller's deadline bounds the wait.
                Err(ResolveError::Protocol(reason)) if reason.starts_with("reply id") => {
                    tracing::debug!(%server, %reason, "discarding DNS reply");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl DnsResolver for UdpResolver {
    /// Queries A and AAAA concurrently; IPv4 answers come first.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let server = self.server_addr().await?;
        let (v4, v6) = tokio::join!(self.query(server, host, RecordType::A), self.query(server, host, RecordType::AAAA));

        let mut ips = Vec::new();
        let mut first_error = None;
        for result in [v4, v6] {
            match result {
                Ok(found) => ips.extend(found),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if !ips.is_empty() {
            return Ok(ips);
        }
        Err(first_error.unwrap_or_else(|| ResolveError::NoRecords(host.to_string())))
    }
}
