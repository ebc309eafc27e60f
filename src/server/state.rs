use crate::config::Config;
use crate::error::StartupError;
use crate::source::{SourceRegistry, StaticSourceRegistry};
use crate::upstream::{ConnectionPool, RefererPolicy, TimeoutPolicy, UpstreamFetcher};
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Fetcher over the process-wide connection pool
    pub fetcher: Arc<UpstreamFetcher>,
    /// Source key lookup
    pub sources: Arc<dyn SourceRegistry>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the pool, fetcher and static source registry from config.
    pub fn new(config: Config) -> Result<Self, StartupError> {
        let registry = StaticSourceRegistry::new(config.sources.clone())?;
        Self::with_registry(config, Arc::new(registry))
    }

    /// Same as [`AppState::new`] with an externally provided registry.
    pub fn with_registry(config: Config, sources: Arc<dyn SourceRegistry>) -> Result<Self, StartupError> {
        let pool = ConnectionPool::new(&config.pool)?;
        let fetcher = UpstreamFetcher::new(
            pool,
            TimeoutPolicy::new(&config.slow_domains, config.timeouts),
            RefererPolicy::new(config.referer_overrides.iter().cloned()),
            config.default_user_agent.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            fetcher: Arc::new(fetcher),
            sources,
            started_at: Instant::now(),
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.fetcher.pool()
    }
}
