//! Service configuration.
//!
//! Built once at startup and passed explicitly to every component.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bse_cache::EvictionPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, ConnectorResult};

/// What happens to an upstream fetch when its client goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Let the fetch finish so the response still lands in the cache.
    #[default]
    Complete,
    /// Drop the fetch together with the request.
    Cancel,
}

impl FromStr for DisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complete" => Ok(Self::Complete),
            "cancel" => Ok(Self::Cancel),
            other => Err(format!("expected 'complete' or 'cancel', got '{}'", other)),
        }
    }
}

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL every passthrough path is appended to.
    pub base_url: String,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Automatic retries for transient failures. Zero disables retrying.
    pub max_retries: u32,

    /// Bearer token sent upstream.
    pub token: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            timeout: Duration::from_secs(30),
            max_retries: 0,
            token: None,
        }
    }
}

fn default_upstream_url() -> String {
    "https://api.bseindia.com/BseIndiaAPI/api".to_string()
}

/// Process-wide service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub cache_dir: PathBuf,
    pub shutdown_grace_period: Duration,
    pub upstream: UpstreamConfig,
    pub max_concurrent_fetches: usize,
    /// How long a miss waits for a fetch slot before answering 503.
    pub fetch_queue_timeout: Duration,
    pub on_disconnect: DisconnectPolicy,
    /// TTL for entries whose upstream response carries no `max-age`.
    pub default_ttl: Option<Duration>,
    pub eviction: EvictionPolicy,
    pub sweep_interval: Duration,
    /// Query parameters that do not change the upstream answer.
    pub ignored_query_params: Vec<String>,
    /// `path?query` values fetched once at startup.
    pub prewarm_paths: Vec<String>,
    /// Mount `DELETE /data/...` and `DELETE /cache`.
    pub allow_invalidation: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cache_dir: bse_cache::default_cache_dir()
                .unwrap_or_else(|_| PathBuf::from("/tmp/bse_mcp_cache")),
            shutdown_grace_period: Duration::from_secs(10),
            upstream: UpstreamConfig::default(),
            max_concurrent_fetches: 16,
            fetch_queue_timeout: Duration::from_secs(5),
            on_disconnect: DisconnectPolicy::default(),
            default_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            eviction: EvictionPolicy::default(),
            sweep_interval: Duration::from_secs(300),
            ignored_query_params: Vec::new(),
            prewarm_paths: Vec::new(),
            allow_invalidation: false,
        }
    }
}

impl ServiceConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `HOST` / `PORT` | Listen address (default `0.0.0.0:8000`) |
    /// | `BSE_CACHE_DIR` | Cache root (default `~/.bse_mcp_cache`) |
    /// | `BSE_UPSTREAM_URL` | Upstream base URL |
    /// | `BSE_UPSTREAM_TOKEN` | Bearer token for the upstream |
    /// | `BSE_UPSTREAM_TIMEOUT_SECS` | Upstream timeout (default 30) |
    /// | `BSE_UPSTREAM_MAX_RETRIES` | Automatic retries (default 0) |
    /// | `BSE_MAX_CONCURRENT_FETCHES` | Concurrent upstream fetches (default 16) |
    /// | `BSE_FETCH_QUEUE_TIMEOUT_MS` | Wait for a fetch slot (default 5000) |
    /// | `BSE_ON_DISCONNECT` | `complete` or `cancel` |
    /// | `BSE_SHUTDOWN_GRACE_SECS` | Shutdown grace period (default 10) |
    /// | `BSE_CACHE_TTL_SECS` | Default TTL, `0` disables expiry (default 86400) |
    /// | `BSE_CACHE_MAX_AGE_SECS` | Sweep age threshold |
    /// | `BSE_CACHE_MAX_BYTES` | Sweep size threshold |
    /// | `BSE_SWEEP_INTERVAL_SECS` | Sweep period (default 300) |
    /// | `BSE_IGNORED_QUERY_PARAMS` | Comma list excluded from fingerprints |
    /// | `BSE_PREWARM_PATHS` | Comma list fetched at startup |
    /// | `BSE_ALLOW_INVALIDATION` | Mount DELETE routes |
    pub fn from_env() -> ConnectorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> ConnectorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let cache_dir = match env.string("BSE_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => bse_cache::default_cache_dir().map_err(|e| ConnectorError::Config {
                message: e.to_string(),
            })?,
        };

        let default_ttl = match env.parse::<u64>("BSE_CACHE_TTL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.default_ttl,
        };

        let eviction = EvictionPolicy::default()
            .with_max_age(env.parse::<u64>("BSE_CACHE_MAX_AGE_SECS")?.map(Duration::from_secs))
            .with_max_total_bytes(env.parse::<u64>("BSE_CACHE_MAX_BYTES")?);

        let config = Self {
            host: env.string("HOST").unwrap_or(defaults.host),
            port: env.parse("PORT")?.unwrap_or(defaults.port),
            cache_dir,
            shutdown_grace_period: env
                .parse::<u64>("BSE_SHUTDOWN_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace_period),
            upstream: UpstreamConfig {
                base_url: env
                    .string("BSE_UPSTREAM_URL")
                    .unwrap_or(defaults.upstream.base_url),
                timeout: env
                    .parse::<u64>("BSE_UPSTREAM_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.upstream.timeout),
                max_retries: env
                    .parse("BSE_UPSTREAM_MAX_RETRIES")?
                    .unwrap_or(defaults.upstream.max_retries),
                token: env.string("BSE_UPSTREAM_TOKEN"),
            },
            max_concurrent_fetches: env
                .parse("BSE_MAX_CONCURRENT_FETCHES")?
                .unwrap_or(defaults.max_concurrent_fetches),
            fetch_queue_timeout: env
                .parse::<u64>("BSE_FETCH_QUEUE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch_queue_timeout),
            on_disconnect: env
                .parse("BSE_ON_DISCONNECT")?
                .unwrap_or(defaults.on_disconnect),
            default_ttl,
            eviction,
            sweep_interval: env
                .parse::<u64>("BSE_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            ignored_query_params: env.list("BSE_IGNORED_QUERY_PARAMS"),
            prewarm_paths: env.list("BSE_PREWARM_PATHS"),
            allow_invalidation: env.flag("BSE_ALLOW_INVALIDATION"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work at runtime.
    pub fn validate(&self) -> ConnectorResult<()> {
        let invalid = |message: String| Err(ConnectorError::Config { message });

        if self.max_concurrent_fetches == 0 {
            return invalid("BSE_MAX_CONCURRENT_FETCHES must be at least 1".to_string());
        }
        if self.sweep_interval.is_zero() {
            return invalid("BSE_SWEEP_INTERVAL_SECS must be greater than 0".to_string());
        }
        if self.upstream.timeout.is_zero() {
            return invalid("BSE_UPSTREAM_TIMEOUT_SECS must be greater than 0".to_string());
        }

        match url::Url::parse(&self.upstream.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(url) => invalid(format!(
                "BSE_UPSTREAM_URL must be http or https, got scheme '{}'",
                url.scheme()
            )),
            Err(e) => invalid(format!(
                "invalid BSE_UPSTREAM_URL '{}': {}",
                self.upstream.base_url, e
            )),
        }
    }

    /// Set the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the listen host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the cache root.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the upstream base URL.
    pub fn with_upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream.base_url = url.into();
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_on_disconnect(mut self, policy: DisconnectPolicy) -> Self {
        self.on_disconnect = policy;
        self
    }

    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max;
        self
    }

    pub fn with_fetch_queue_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_queue_timeout = timeout;
        self
    }

    pub fn with_ignored_query_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_query_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allow_invalidation(mut self, allow: bool) -> Self {
        self.allow_invalidation = allow;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Typed access to a variable source. Empty values count as unset.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> ConnectorResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse().map_err(|e| ConnectorError::Config {
                    message: format!("invalid {}={:?}: {}", key, raw, e),
                })
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> bool {
        self.string(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}
