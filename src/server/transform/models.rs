use serde::Deserialize;
use std::time::Duration;

/// A single static rewrite rule
///
/// `match` is a `host[/path]` prefix compared on path-component boundaries
/// against the normalised `registry/repository` of an image. The matched
/// prefix is replaced by `replace`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RewriteRule {
    #[serde(rename = "match")]
    pub match_prefix: String,
    pub replace: String,
}

/// Configuration for the static transformer
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    /// Rules in declaration order (earlier rules win ties)
    #[serde(default)]
    pub rules: Vec<RewriteRule>,
}

/// Configuration for the dynamic transformer backed by Harbor proxy-cache projects
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicConfig {
    /// Harbor base URL (e.g., "https://harbor.example.com")
    pub endpoint: String,
    /// Optional: Harbor username for API access (robot accounts work)
    #[serde(default)]
    pub username: Option<String>,
    /// Optional: Harbor password or robot token
    #[serde(default)]
    pub password: Option<String>,
    /// Interval in seconds between full mapping refreshes (default: 300)
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Upper bound in milliseconds for a resolution made on behalf of a request (default: 2000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Time-to-live in seconds for cached mappings (default: 600)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// How long startup may wait for the first full sync before giving up (default: 120)
    #[serde(default = "default_bootstrap_timeout_secs")]
    pub bootstrap_timeout_secs: u64,
}

impl DynamicConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_bootstrap_timeout_secs() -> u64 {
    120
}
