//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Command-line overrides
//! 2. Environment variables (MODCACHE_*)
//! 3. Deployment environment variables (PORT, CACHE_DIR, UPSTREAM_PROXY, DNS_SERVER)
//! 4. TOML config file (if given)
//! 5. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Environment variables consulted for a forward proxy, in precedence order.
pub const PROXY_ENV_VARS: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "SOCKS5_PROXY"];

/// Deployment environment variables accepted without the MODCACHE_ prefix.
const DEPLOYMENT_ENV_VARS: &[&str] = &["PORT", "CACHE_DIR", "UPSTREAM_PROXY", "DNS_SERVER"];

/// Application configuration with layered loading.
///
/// Immutable for the process lifetime once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root directory of the disk cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Base URL of the upstream module proxy.
    ///
    /// Set via MODCACHE_UPSTREAM or UPSTREAM_PROXY.
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Forward proxy URL (http://, https://, socks5://, socks5h://).
    ///
    /// When unset, HTTP_PROXY, HTTPS_PROXY and SOCKS5_PROXY are consulted.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Resolver descriptor (e.g. `8.8.8.8:53`, `tls://1.1.1.1`, `https://cloudflare-dns.com/dns-query`).
    ///
    /// Set via MODCACHE_DNS or DNS_SERVER.
    #[serde(default)]
    pub dns: Option<String>,

    /// User-Agent string for upstream requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Overall timeout for buffered upstream fetches (list, info, mod).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Overall timeout for archive fetches.
    #[serde(default = "default_archive_timeout_ms")]
    pub archive_timeout_ms: u64,
}

fn default_port() -> u16 {
    12345
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_upstream() -> String {
    "https://proxy.golang.org".into()
}

fn default_user_agent() -> String {
    concat!("modcache/", env!("CARGO_PKG_VERSION")).into()
}

fn default_request_timeout_ms() -> u64 {
    300_000
}

fn default_archive_timeout_ms() -> u64 {
    600_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cache_dir: default_cache_dir(),
            upstream: default_upstream(),
            proxy: None,
            dns: None,
            user_agent: default_user_agent(),
            request_timeout_ms: default_request_timeout_ms(),
            archive_timeout_ms: default_archive_timeout_ms(),
        }
    }
}

/// Highest-precedence configuration layer, usually filled from command-line flags.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
}

impl AppConfig {
    /// Timeout for buffered upstream fetches.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Timeout for archive fetches.
    pub fn archive_timeout(&self) -> Duration {
        Duration::from_millis(self.archive_timeout_ms)
    }

    /// Upstream base URL without a trailing slash.
    pub fn upstream_base(&self) -> &str {
        self.upstream.trim_end_matches('/')
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. `overrides`
    /// 2. Environment variables prefixed with `MODCACHE_`
    /// 3. `PORT`, `CACHE_DIR`, `UPSTREAM_PROXY`, `DNS_SERVER`
    /// 4. TOML file from `overrides.config_file` or `MODCACHE_CONFIG_FILE`
    /// 5. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load(overrides: Overrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let config_file = overrides
            .config_file
            .clone()
            .or_else(|| std::env::var_os("MODCACHE_CONFIG_FILE").map(PathBuf::from));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment
            .merge(Env::raw().only(DEPLOYMENT_ENV_VARS).map(|key| {
                let key = key.as_str().to_ascii_lowercase();
                match key.as_str() {
                    "upstream_proxy" => "upstream".into(),
                    "dns_server" => "dns".into(),
                    _ => key.into(),
                }
            }))
            .merge(
                Env::prefixed("MODCACHE_")
                    .ignore(&["CONFIG_FILE"])
                    .map(|key| key.as_str().to_lowercase().into()),
            )
            .merge(Serialized::globals(overrides));

        let mut config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.proxy = config.proxy.filter(|p| !p.trim().is_empty());
        config.dns = config.dns.filter(|d| !d.trim().is_empty());

        config.validate()?;

        Ok(config)
    }

    /// Effective forward-proxy URL from the process environment.
    pub fn proxy_url(&self) -> Option<String> {
        self.proxy_url_with(|name| std::env::var(name).ok())
    }

    /// Effective forward-proxy URL.
    ///
    /// The explicit `proxy` value wins; otherwise the first non-empty of
    /// `HTTP_PROXY`, `HTTPS_PROXY`, `SOCKS5_PROXY` as reported by `lookup`.
    pub fn proxy_url_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        if let Some(proxy) = self.proxy.as_deref().filter(|p| !p.is_empty()) {
            return Some(proxy.to_string());
        }
        PROXY_ENV_VARS
            .iter()
            .filter_map(|name| lookup(name))
            .find(|value| !value.is_empty())
    }
}
