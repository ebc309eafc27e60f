use super::segment::stream_response;
use super::{ProxyQuery, ProxyRequestDescriptor, finish, resolve_source, upstream_error};
use crate::{
    error::Result,
    hls::{self, RewriteContext},
    metrics,
    server::{public_base::proxy_base, state::AppState},
    upstream::{RequestKind, UpstreamRequest},
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

/// Short shared cache so repeated live playlist polls are absorbed.
pub const MANIFEST_CACHE_CONTROL: &str = "public, max-age=10";
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Fetch a playlist and rewrite it so every URI routes through the proxy.
///
/// Responses that are not playlists are passed through unchanged.
pub async fn serve_manifest(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    finish("m3u8", start, proxy_manifest(&state, query, &headers).await)
}

async fn proxy_manifest(state: &AppState, query: ProxyQuery, headers: &HeaderMap) -> Result<Response> {
    let request = ProxyRequestDescriptor::from_query(query, state.config.block_private_targets)?;
    let source = resolve_source(state, &request.source_key).await?;

    info!(
        "Serving manifest: {} (source {}, {})",
        request.target_url,
        request.source_key,
        if source.is_live { "live" } else { "vod" }
    );
    debug!("Source {} home: {}", request.source_key, source.base_url);

    let upstream = state
        .fetcher
        .fetch(UpstreamRequest {
            url: &request.target_url,
            kind: RequestKind::Manifest,
            range: None,
            source: &source,
        })
        .await
        .map_err(|e| upstream_error(e, RequestKind::Manifest))?;

    if !should_buffer(upstream.content_type(), upstream.url()) {
        debug!(
            "Passing through {} ({})",
            upstream.url(),
            upstream.content_type().unwrap_or("no content type")
        );
        return Ok(stream_response(upstream, &state.config.stream, None, "m3u8"));
    }

    let status = upstream.status();
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let playlist_url = upstream.url().clone();
    let body = upstream
        .read_to_limit(state.config.max_manifest_bytes)
        .await
        .map_err(|e| upstream_error(e, RequestKind::Manifest))?;

    if !hls::is_playlist(&body) {
        // Mislabelled binary: hand it back as-is.
        debug!("{} is not a playlist, returning {} raw bytes", playlist_url, body.len());
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            content_type.unwrap_or(HeaderValue::from_static("application/octet-stream")),
        );
        return Ok(response);
    }

    let base = proxy_base(state.config.public_base_url.as_deref(), headers);
    let rewritten = hls::rewrite_playlist_bytes(
        &body,
        &RewriteContext {
            playlist_url: &playlist_url,
            proxy_base: &base,
            source_key: &request.source_key,
            allow_cors: request.allow_cors,
        },
    );
    metrics::record_manifest_rewrite(rewritten.stats.rewritten, rewritten.stats.untouched);

    info!(
        "Rewrote manifest {}: {} URIs proxied",
        playlist_url, rewritten.stats.rewritten
    );

    Ok((
        [
            (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
            (header::CACHE_CONTROL, MANIFEST_CACHE_CONTROL),
        ],
        rewritten.body,
    )
        .into_response())
}

/// Content types that may carry a playlist. Some origins label playlists
/// `application/octet-stream`, so that counts too.
fn should_buffer(content_type: Option<&str>, url: &Url) -> bool {
    match content_type.map(str::to_ascii_lowercase) {
        Some(ct) => ct.contains("mpegurl") || ct.contains("octet-stream"),
        None => {
            let path = url.path().to_ascii_lowercase();
            path.ends_with(".m3u8") || path.ends_with(".m3u")
        }
    }
}
