use super::{ProxyQuery, ProxyRequestDescriptor, finish, resolve_source, upstream_error};
use crate::{
    error::Result,
    server::state::AppState,
    streaming::{self, StreamSettings},
    upstream::{RequestKind, UpstreamRequest, UpstreamResponse},
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// Long-lived cache for immutable media.
pub const SEGMENT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

const FORWARDED_HEADERS: [header::HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::LAST_MODIFIED,
    header::ETAG,
    header::ACCEPT_RANGES,
];

/// Proxy a media segment (or any non-playlist resource) from the origin.
///
/// The player's `Range` header is forwarded and the body is streamed with
/// bounded buffering.
pub async fn serve_segment(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    finish("segment", start, proxy_segment(&state, query, &headers, "segment").await)
}

/// Same as [`serve_segment`] for encryption keys.
pub async fn serve_key(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    finish("key", start, proxy_segment(&state, query, &headers, "key").await)
}

async fn proxy_segment(
    state: &AppState,
    query: ProxyQuery,
    headers: &HeaderMap,
    label: &'static str,
) -> Result<Response> {
    let request = ProxyRequestDescriptor::from_query(query, state.config.block_private_targets)?;
    let source = resolve_source(state, &request.source_key).await?;
    let range = headers.get(header::RANGE);

    info!(
        "Serving {}: {} (source {}{})",
        label,
        request.target_url,
        request.source_key,
        range
            .and_then(|r| r.to_str().ok())
            .map(|r| format!(", {r}"))
            .unwrap_or_default()
    );

    let upstream = state
        .fetcher
        .fetch(UpstreamRequest {
            url: &request.target_url,
            kind: RequestKind::Segment,
            range,
            source: &source,
        })
        .await
        .map_err(|e| upstream_error(e, RequestKind::Segment))?;

    Ok(stream_response(
        upstream,
        &state.config.stream,
        Some(SEGMENT_CACHE_CONTROL),
        label,
    ))
}

/// Relay an upstream response to the client, preserving its status and the
/// headers a player needs for ranged playback.
pub(super) fn stream_response(
    upstream: UpstreamResponse,
    settings: &StreamSettings,
    cache_control: Option<&'static str>,
    label: &'static str,
) -> Response {
    let budget = upstream.budget();
    let (status, upstream_headers, body, lease) = upstream.into_parts();

    let mut response = Response::new(streaming::relay(body, lease, budget, settings, label).into_body());
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for name in FORWARDED_HEADERS {
        if let Some(value) = upstream_headers.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("application/octet-stream"));
    headers
        .entry(header::ACCEPT_RANGES)
        .or_insert(HeaderValue::from_static("bytes"));
    if let Some(cache_control) = cache_control {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }

    response
}
