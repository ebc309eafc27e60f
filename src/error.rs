//! Error types surfaced at the HTTP edge.
//!
//! Handlers return [`Result`]; every variant renders as a JSON
//! `{"error": "..."}` body so players can read the failure cross-origin.

use crate::source::SourceError;
use crate::upstream::{FetchError, RequestKind};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use tracing::error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Upstream timed out after {}ms", .0.as_millis())]
    UpstreamTimeout(Duration),

    #[error("Upstream network error: {0}")]
    UpstreamNetwork(String),

    /// Upstream answered with a non-success status. The carried code is
    /// already the one sent to the client (5xx capped, see [`ProxyError::from_fetch`]).
    #[error("Upstream returned status {}", .0.as_u16())]
    UpstreamStatus(StatusCode),
}

impl ProxyError {
    /// Map a classified upstream failure onto the client-facing taxonomy.
    ///
    /// Upstream 4xx codes are mirrored. Upstream 5xx codes are not leaked:
    /// manifests report 502, segments report 500.
    pub fn from_fetch(err: FetchError, kind: RequestKind) -> Self {
        match err {
            FetchError::Timeout { budget, .. } => Self::UpstreamTimeout(budget),
            FetchError::Status { status, .. } => Self::UpstreamStatus(cap_upstream_status(status, kind)),
            FetchError::UnsupportedScheme(url) => Self::InvalidTarget(url),
            err @ (FetchError::Network { .. } | FetchError::TooLarge { .. }) => {
                Self::UpstreamNetwork(err.to_string())
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingParameter(_) | Self::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            Self::UnknownSource(_) => StatusCode::NOT_FOUND,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamNetwork(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamStatus(status) => *status,
        }
    }
}

fn cap_upstream_status(status: StatusCode, kind: RequestKind) -> StatusCode {
    if status.is_client_error() {
        status
    } else if status.is_server_error() && kind == RequestKind::Segment {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::BAD_GATEWAY
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = %status, error = %self, "Proxy request failed");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Failures that stop the server from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to load sources: {0}")]
    Sources(#[from] SourceError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
