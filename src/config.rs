use crate::source::{self, SourceDefinition, SourceError};
use crate::streaming::StreamSettings;
use crate::upstream::{PoolSettings, TimeoutBudgets};
use crate::upstream::fetcher::DEFAULT_USER_AGENT;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default cap on a buffered playlist body.
pub const DEFAULT_MAX_MANIFEST_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required in production")]
    Missing(&'static str),

    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Sources(#[from] SourceError),
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    /// Public origin of the proxy (e.g. `https://relay.example.com`). When
    /// unset, the base is derived from each request's headers.
    pub public_base_url: Option<String>,
    pub default_user_agent: String,
    pub sources: Vec<SourceDefinition>,
    /// Origins that get the longer timeout budgets.
    pub slow_domains: Vec<String>,
    /// `(domain, referer)` pairs for hotlink-protected origins.
    pub referer_overrides: Vec<(String, String)>,
    pub pool: PoolSettings,
    pub stream: StreamSettings,
    pub timeouts: TimeoutBudgets,
    pub max_manifest_bytes: usize,
    /// Reject target URLs that are private or loopback IP literals.
    pub block_private_targets: bool,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and a
    /// sources definition are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let is_dev = env::var("DEV_MODE")
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(false);

        let port = match env::var("PORT") {
            Ok(v) => parse_value("PORT", &v)?,
            Err(_) if is_dev => 3000,
            Err(_) => return Err(ConfigError::Missing("PORT")),
        };

        let sources = if let Ok(path) = env::var("SOURCES_PATH") {
            source::load_definitions(Path::new(&path))?
        } else if let Ok(json) = env::var("SOURCES_JSON") {
            source::parse_definitions(&json)?
        } else if is_dev {
            warn!("No SOURCES_PATH or SOURCES_JSON set, registering the 'dev' source");
            vec![SourceDefinition {
                key: "dev".to_string(),
                base_url: "http://localhost/".to_string(),
                user_agent: None,
                is_live: false,
                timeout_class: Default::default(),
            }]
        } else {
            return Err(ConfigError::Missing("SOURCES_PATH"));
        };

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());
        if let Some(base) = &public_base_url {
            let parsed = url::Url::parse(base).map_err(|e| ConfigError::Invalid {
                var: "PUBLIC_BASE_URL",
                value: base.clone(),
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid {
                    var: "PUBLIC_BASE_URL",
                    value: base.clone(),
                    reason: "must be http or https".to_string(),
                });
            }
        }

        let default_user_agent = env::var("DEFAULT_USER_AGENT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let slow_domains = env::var("SLOW_DOMAINS")
            .map(|v| parse_domain_list(&v))
            .unwrap_or_default();

        let referer_overrides = match env::var("REFERER_OVERRIDES") {
            Ok(v) => parse_referer_overrides(&v)?,
            Err(_) => Vec::new(),
        };

        let pool_defaults = PoolSettings::default();
        let pool = PoolSettings {
            max_connections: env_or("POOL_MAX_CONNECTIONS", pool_defaults.max_connections)?,
            max_idle_per_host: env_or("POOL_MAX_IDLE_PER_HOST", pool_defaults.max_idle_per_host)?,
            idle_timeout: env_secs_or("POOL_IDLE_TIMEOUT_SECS", pool_defaults.idle_timeout)?,
        };

        let stream_defaults = StreamSettings::default();
        let stream = StreamSettings {
            chunk_size: env_or("STREAM_CHUNK_SIZE", stream_defaults.chunk_size)?.max(1),
            window_chunks: env_or("STREAM_WINDOW_CHUNKS", stream_defaults.window_chunks)?.max(1),
        };

        let budget_defaults = TimeoutBudgets::default();
        let timeouts = TimeoutBudgets {
            manifest: env_secs_or("MANIFEST_TIMEOUT_SECS", budget_defaults.manifest)?,
            slow_manifest: env_secs_or("SLOW_MANIFEST_TIMEOUT_SECS", budget_defaults.slow_manifest)?,
            segment: env_secs_or("SEGMENT_TIMEOUT_SECS", budget_defaults.segment)?,
            slow_segment: env_secs_or("SLOW_SEGMENT_TIMEOUT_SECS", budget_defaults.slow_segment)?,
        };

        let max_manifest_bytes = env_or("MAX_MANIFEST_BYTES", DEFAULT_MAX_MANIFEST_BYTES)?;

        let block_private_targets = match env::var("BLOCK_PRIVATE_TARGETS") {
            Ok(v) => parse_bool(&v).ok_or_else(|| ConfigError::Invalid {
                var: "BLOCK_PRIVATE_TARGETS",
                value: v.clone(),
                reason: "expected true or false".to_string(),
            })?,
            Err(_) => true,
        };

        Ok(Config {
            port,
            is_dev,
            public_base_url,
            default_user_agent,
            sources,
            slow_domains,
            referer_overrides,
            pool,
            stream,
            timeouts,
            max_manifest_bytes,
            block_private_targets,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_value<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn env_or<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(v) => parse_value(var, &v),
        Err(_) => Ok(default),
    }
}

fn env_secs_or(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(v) => parse_value::<u64>(var, &v).map(Duration::from_secs),
        Err(_) => Ok(default),
    }
}

/// `a.example, .b.example ,` → `["a.example", "b.example"]`
fn parse_domain_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

/// `domain=referer` pairs separated by commas.
fn parse_referer_overrides(value: &str) -> Result<Vec<(String, String)>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (domain, referer) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
                var: "REFERER_OVERRIDES",
                value: entry.to_string(),
                reason: "expected domain=referer".to_string(),
            })?;
            Ok((domain.trim().to_ascii_lowercase(), referer.trim().to_string()))
        })
        .collect()
}
