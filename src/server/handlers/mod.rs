pub mod health;
pub mod manifest;
pub mod segment;

use crate::error::{ProxyError, Result};
use crate::metrics;
use crate::server::state::AppState;
use crate::server::url_validation::validate_target_url;
use crate::source::UpstreamSourceConfig;
use crate::upstream::{FetchError, RequestKind};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::time::Instant;
use tracing::warn;
use url::Url;

/// Raw query of the proxy endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub source: Option<String>,
    #[serde(rename = "allowCORS")]
    pub allow_cors: Option<String>,
}

/// Validated proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequestDescriptor {
    pub target_url: Url,
    pub source_key: String,
    pub allow_cors: bool,
}

impl ProxyRequestDescriptor {
    pub fn from_query(query: ProxyQuery, block_private: bool) -> Result<Self> {
        let url = query
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or(ProxyError::MissingParameter("url"))?;
        let source_key = query
            .source
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ProxyError::MissingParameter("source"))?;

        Ok(Self {
            target_url: validate_target_url(&url, block_private)?,
            source_key,
            allow_cors: query
                .allow_cors
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
        })
    }
}

/// Look up the source or fail closed.
async fn resolve_source(state: &AppState, key: &str) -> Result<UpstreamSourceConfig> {
    state.sources.resolve_source(key).await.ok_or_else(|| {
        warn!("Rejecting request for unknown source '{}'", key);
        ProxyError::UnknownSource(key.to_string())
    })
}

fn upstream_error(err: FetchError, kind: RequestKind) -> ProxyError {
    metrics::record_upstream_error(err.kind());
    warn!("Upstream fetch failed: {}", err);
    ProxyError::from_fetch(err, kind)
}

/// Record request telemetry and render the outcome.
fn finish(endpoint: &'static str, start: Instant, result: Result<Response>) -> Response {
    let response = result.unwrap_or_else(IntoResponse::into_response);
    metrics::record_request(endpoint, response.status().as_u16());
    metrics::record_duration(endpoint, start);
    response
}

/// CORS preflight; the headers come from the router's layers.
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}
