//! DNS-over-HTTPS with the JSON answer format.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;

use super::{DnsResolver, ResolveError};

/// Default request timeout for DoH queries.
const DOH_TIMEOUT: Duration = Duration::from_secs(10);

/// DNS record type number for A.
const TYPE_A: u16 = 1;

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// Resolver issuing `GET <endpoint>?name=<host>&type=A`.
#[derive(Debug, Clone)]
pub struct DohResolver {
    http: Client,
    endpoint: String,
}

impl DohResolver {
    pub fn new(endpoint: String) -> Result<Self, ResolveError> {
        let http = Client::builder()
            .timeout(DOH_TIMEOUT)
            .use_rustls_tls()
            .build()
            .map_err(|e| ResolveError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, endpoint })
    }
}

/// Keep only A records whose data parses as an address.
fn parse_answer(host: &str, body: &[u8]) -> Result<Vec<IpAddr>, ResolveError> {
    let response: DohResponse =
        serde_json::from_slice(body).map_err(|e| ResolveError::Protocol(format!("invalid DoH JSON: {e}")))?;

    let ips: Vec<IpAddr> = response
        .answer
        .iter()
        .filter(|answer| answer.record_type == TYPE_A)
        .filter_map(|answer| answer.data.parse().ok())
        .collect();

    if ips.is_empty() {
        return Err(ResolveError::NoRecords(host.to_string()));
    }
    Ok(ips)
}

#[async_trait]
impl DnsResolver for DohResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("name", host), ("type", "A")])
            .header(header::ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| ResolveError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Http(format!("DoH server returned status {}", status.as_u16())));
        }

        let body = response.bytes().await.map_err(|e| ResolveError::Http(e.to_string()))?;
        parse_answer(host, &body)
    }
}
