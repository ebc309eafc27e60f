//! Source registry seam.
//!
//! The proxy only needs `resolve_source(key)`. Management of the registry
//! lives elsewhere; this module provides the trait plus a static,
//! JSON-backed implementation loaded at startup.

use crate::upstream::TimeoutClass;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use url::Url;

/// Per-request view of a registered source. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSourceConfig {
    /// Home of the source (catalog/API root). Logged with each request.
    pub base_url: Url,
    /// User-Agent to present upstream; `None` means the configured default.
    pub user_agent: Option<String>,
    pub is_live: bool,
    pub timeout_class: TimeoutClass,
}

/// Lookup contract consumed by the proxy handlers.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Resolve a short source key. `None` makes the request fail closed.
    async fn resolve_source(&self, key: &str) -> Option<UpstreamSourceConfig>;

    /// Number of known sources, for health reporting.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One entry of the sources file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceDefinition {
    pub key: String,
    pub base_url: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub timeout_class: TimeoutClass,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read sources file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid sources JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("source '{key}' has an invalid base_url: {reason}")]
    InvalidBaseUrl { key: String, reason: String },

    #[error("source '{0}' is defined more than once")]
    DuplicateKey(String),

    #[error("source definition with an empty key")]
    EmptyKey,
}

/// Parse a JSON array of [`SourceDefinition`]s.
pub fn parse_definitions(json: &str) -> Result<Vec<SourceDefinition>, SourceError> {
    Ok(serde_json::from_str(json)?)
}

/// Read and parse a sources file.
pub fn load_definitions(path: &Path) -> Result<Vec<SourceDefinition>, SourceError> {
    let json = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_definitions(&json)
}

/// In-memory registry built from definitions at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticSourceRegistry {
    sources: HashMap<String, UpstreamSourceConfig>,
}

impl StaticSourceRegistry {
    pub fn new(definitions: Vec<SourceDefinition>) -> Result<Self, SourceError> {
        let mut sources = HashMap::with_capacity(definitions.len());

        for def in definitions {
            let key = def.key.trim().to_string();
            if key.is_empty() {
                return Err(SourceError::EmptyKey);
            }

            let base_url = Url::parse(&def.base_url).map_err(|e| SourceError::InvalidBaseUrl {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            if !matches!(base_url.scheme(), "http" | "https") {
                return Err(SourceError::InvalidBaseUrl {
                    key,
                    reason: format!("scheme '{}' is not http(s)", base_url.scheme()),
                });
            }

            let config = UpstreamSourceConfig {
                base_url,
                user_agent: def.user_agent.filter(|ua| !ua.trim().is_empty()),
                is_live: def.is_live,
                timeout_class: def.timeout_class,
            };

            if sources.insert(key.clone(), config).is_some() {
                return Err(SourceError::DuplicateKey(key));
            }
        }

        info!("Loaded {} upstream sources", sources.len());
        Ok(Self { sources })
    }
}

#[async_trait]
impl SourceRegistry for StaticSourceRegistry {
    async fn resolve_source(&self, key: &str) -> Option<UpstreamSourceConfig> {
        self.sources.get(key).cloned()
    }

    fn len(&self) -> usize {
        self.sources.len()
    }
}
