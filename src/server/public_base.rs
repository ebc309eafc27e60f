//! Public base URL of the proxy, used to build rewritten links.

use axum::http::HeaderMap;
use axum::http::header::{HOST, REFERER};
use url::Url;

/// Path prefix of the proxy endpoints.
pub const PROXY_PATH: &str = "/proxy";

/// `scheme://host/proxy` for links in a rewritten playlist.
///
/// A configured public origin wins. Otherwise the scheme comes from the
/// first `X-Forwarded-Proto` value, then the `Referer` scheme, then `http`,
/// and the host from the `Host` header. Without a usable `Host` the links
/// are relative (`/proxy/...`).
pub fn proxy_base(configured: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(origin) = configured {
        return format!("{}{}", origin.trim_end_matches('/'), PROXY_PATH);
    }

    let Some(host) = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| is_plausible_host(h))
    else {
        return PROXY_PATH.to_string();
    };

    format!("{}://{}{}", request_scheme(headers), host, PROXY_PATH)
}

fn request_scheme(headers: &HeaderMap) -> &'static str {
    let forwarded = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase());

    match forwarded.as_deref() {
        Some("https") => return "https",
        Some("http") => return "http",
        _ => {}
    }

    let referer_scheme = headers
        .get(REFERER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Url::parse(v).ok())
        .map(|u| u.scheme().to_string());

    match referer_scheme.as_deref() {
        Some("https") => "https",
        _ => "http",
    }
}

/// Rejects values that would let a client inject a path or credentials
/// into generated links.
fn is_plausible_host(host: &str) -> bool {
    !host.is_empty()
        && !host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '@' | '?' | '#'))
}
