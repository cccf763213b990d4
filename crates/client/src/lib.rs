//! Outbound side of modcache.
//!
//! This crate provides the pluggable resolver, the proxy-aware dialer and
//! pooled transport built on it, and the upstream fetcher used on cache misses.

pub mod dns;
pub mod tls;
pub mod transport;
pub mod upstream;

pub use dns::{DnsResolver, ResolveError, Resolver, ResolverDescriptor, build_resolver};
pub use transport::{DialError, Dialer, ProxyDescriptor, ProxyKind, Transport};
pub use upstream::{Upstream, UpstreamBody};
