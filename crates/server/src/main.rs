//! modcache server entry point.
//!
//! Boots the module-proxy cache over HTTP. Logging goes to stderr as JSON.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use modcache_client::{ProxyDescriptor, Transport, Upstream, build_resolver, transport};
use modcache_core::{AppConfig, DiskCache, Overrides};

mod coordinator;
mod error;
mod router;

/// Read-through disk cache for the Go module proxy protocol.
#[derive(Debug, Parser)]
#[command(name = "modcache", version, about)]
struct Args {
    /// Port to listen on.
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Cache directory.
    #[arg(long = "cache", value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Upstream module proxy URL.
    #[arg(long, value_name = "URL")]
    upstream: Option<String>,

    /// Forward proxy URL (e.g. http://proxy:8080 or socks5://proxy:1080).
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// DNS server (e.g. 8.8.8.8:53, https://cloudflare-dns.com/dns-query, tls://1.1.1.1:853).
    #[arg(long, value_name = "DESCRIPTOR")]
    dns: Option<String>,

    /// Optional TOML configuration file.
    #[arg(long = "config", env = "MODCACHE_CONFIG_FILE", value_name = "PATH")]
    config_file: Option<PathBuf>,
}

impl From<Args> for Overrides {
    fn from(args: Args) -> Self {
        Overrides {
            config_file: args.config_file,
            port: args.port,
            cache_dir: args.cache_dir,
            upstream: args.upstream,
            proxy: args.proxy,
            dns: args.dns,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load(Args::parse().into()).context("failed to load configuration")?;

    let cache = DiskCache::open(&config.cache_dir)
        .await
        .with_context(|| format!("failed to create cache directory {}", config.cache_dir.display()))?;

    let resolver = match build_resolver(config.dns.as_deref().unwrap_or_default()) {
        Ok(resolver) => resolver,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring DNS configuration; using system resolver");
            None
        }
    };
    match &resolver {
        Some(resolver) => tracing::info!(resolver = %resolver.descriptor(), "using custom DNS resolver"),
        None => tracing::info!("using system DNS resolver"),
    }

    let proxy = ProxyDescriptor::from_config(config.proxy_url().as_deref());
    if let Some(proxy) = &proxy {
        tracing::info!(proxy = %proxy, "using forward proxy");
    }

    let outbound = Transport::build(resolver, proxy).context("failed to build upstream transport")?;
    let upstream = Upstream::new(config.upstream_base(), outbound, config.user_agent.clone());
    let coordinator =
        coordinator::Coordinator::new(cache, upstream, config.request_timeout(), config.archive_timeout());
    let app = router::build_router(coordinator);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        addr = %addr,
        cache_dir = %config.cache_dir.display(),
        upstream = config.upstream_base(),
        max_idle_per_host = transport::MAX_IDLE_PER_HOST,
        max_idle_conns = transport::MAX_IDLE_CONNS,
        "modcache listening"
    );
    tracing::info!("set GOPROXY=http://localhost:{},direct", config.port);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("modcache stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
