//! Single outbound request through the pool.
//!
//! The fetcher never retries. It classifies the outcome (timeout, network,
//! non-2xx status) and leaves policy to the caller.

use super::policy::{RefererPolicy, RequestKind, TimeoutPolicy};
use super::pool::{ConnectionPool, PoolLease, PooledClient, Scheme};
use crate::source::UpstreamSourceConfig;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use reqwest::StatusCode;
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue, RANGE, REFERER, USER_AGENT,
};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// User-Agent sent when the source does not pin one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("timed out after {}ms fetching {url}", .budget.as_millis())]
    Timeout { url: String, budget: Duration },

    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("upstream returned {status} for {url}")]
    Status { url: String, status: StatusCode },

    #[error("body of {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

impl FetchError {
    fn from_reqwest(err: reqwest::Error, url: &Url, budget: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
                budget,
            }
        } else {
            Self::Network {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// Short label for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Network { .. } => "network",
            Self::Status { .. } => "status",
            Self::TooLarge { .. } => "too_large",
            Self::UnsupportedScheme(_) => "scheme",
        }
    }
}

/// Inputs for one outbound exchange.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamRequest<'a> {
    pub url: &'a Url,
    pub kind: RequestKind,
    /// `Range` header forwarded from the player (segments only).
    pub range: Option<&'a HeaderValue>,
    pub source: &'a UpstreamSourceConfig,
}

/// A successful (2xx) upstream response that still owns its pool lease.
#[derive(Debug)]
pub struct UpstreamResponse {
    status: StatusCode,
    response: reqwest::Response,
    lease: PoolLease,
    budget: Duration,
    url: Url,
}

impl UpstreamResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Budget that applies to every remaining await on this exchange.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Final URL after redirects; relative playlist URIs resolve against it.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Buffer the whole body, failing once it grows past `limit` bytes.
    ///
    /// Each chunk read is bounded by the exchange budget. The lease is
    /// released when this returns, on success or failure.
    pub async fn read_to_limit(mut self, limit: usize) -> Result<Bytes, FetchError> {
        let too_large = |url: &Url| FetchError::TooLarge {
            url: url.to_string(),
            limit,
        };

        let declared = self.response.content_length().unwrap_or(0);
        if declared > limit as u64 {
            return Err(too_large(&self.url));
        }

        let mut body = BytesMut::with_capacity((declared as usize).min(limit));
        loop {
            let next = tokio::time::timeout(self.budget, self.response.chunk())
                .await
                .map_err(|_| FetchError::Timeout {
                    url: self.url.to_string(),
                    budget: self.budget,
                })?
                .map_err(|e| FetchError::from_reqwest(e, &self.url, self.budget))?;

            match next {
                Some(chunk) => {
                    if body.len() + chunk.len() > limit {
                        return Err(too_large(&self.url));
                    }
                    body.extend_from_slice(&chunk);
                }
                None => break,
            }
        }

        debug!("Buffered {} bytes from {}", body.len(), self.url);
        Ok(body.freeze())
    }

    /// Split into status, headers, the body stream and the lease that must
    /// outlive the stream.
    pub fn into_parts(
        self,
    ) -> (
        StatusCode,
        HeaderMap,
        impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
        PoolLease,
    ) {
        let headers = self.response.headers().clone();
        (self.status, headers, self.response.bytes_stream(), self.lease)
    }
}

/// Issues upstream requests with the configured policies.
#[derive(Debug, Clone)]
pub struct UpstreamFetcher {
    pool: ConnectionPool,
    timeouts: TimeoutPolicy,
    referers: RefererPolicy,
    default_user_agent: String,
}

impl UpstreamFetcher {
    pub fn new(
        pool: ConnectionPool,
        timeouts: TimeoutPolicy,
        referers: RefererPolicy,
        default_user_agent: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            timeouts,
            referers,
            default_user_agent: default_user_agent.into(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Perform exactly one GET.
    ///
    /// The budget covers waiting for a pool slot, connecting and receiving
    /// the response head. Body reads are bounded separately by the caller
    /// using [`UpstreamResponse::budget`].
    pub async fn fetch(&self, request: UpstreamRequest<'_>) -> Result<UpstreamResponse, FetchError> {
        let url = request.url;
        let scheme =
            Scheme::from_url(url).ok_or_else(|| FetchError::UnsupportedScheme(url.to_string()))?;

        let host = url.host_str().unwrap_or_default();
        let budget = self
            .timeouts
            .budget(host, request.kind, request.source.timeout_class);
        let referer = self.referers.referer_for(url);
        let user_agent = request
            .source
            .user_agent
            .as_deref()
            .filter(|ua| !ua.is_empty())
            .unwrap_or(&self.default_user_agent);

        debug!(
            "Fetching {:?} {} (budget {}ms, referer {})",
            request.kind,
            url,
            budget.as_millis(),
            referer
        );

        let exchange = async {
            let PooledClient { client, lease } =
                self.pool
                    .acquire(scheme)
                    .await
                    .map_err(|e| FetchError::Network {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;

            let mut builder = client
                .get(url.clone())
                .header(USER_AGENT, user_agent)
                .header(REFERER, referer)
                .header(ACCEPT, "*/*")
                .header(ACCEPT_ENCODING, "identity");

            if let Some(range) = request.range {
                builder = builder.header(RANGE, range.clone());
            }

            let response = builder
                .send()
                .await
                .map_err(|e| FetchError::from_reqwest(e, url, budget))?;

            Ok::<_, FetchError>((response, lease))
        };

        let (response, lease) = tokio::time::timeout(budget, exchange)
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
                budget,
            })??;

        let status = response.status();
        if !status.is_success() {
            warn!("Upstream returned {} for {}", status, url);
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        Ok(UpstreamResponse {
            status,
            url: response.url().clone(),
            response,
            lease,
            budget,
        })
    }
}
