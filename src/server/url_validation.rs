use crate::error::ProxyError;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Decode and validate the `url` query parameter.
///
/// The query extractor has already percent-decoded the value once; players
/// that double-encode get one more pass. Only absolute `http://` and
/// `https://` URLs with a host are accepted.
///
/// With `block_private` set, **IP literals** are checked against private and
/// reserved ranges (SSRF protection). **Hostnames** are accepted without DNS
/// resolution: DNS rebinding is a known limitation accepted here.
///
/// # Errors
/// Returns [`ProxyError::InvalidTarget`] for:
/// - Invalid or relative URLs
/// - Non-HTTP(S) schemes
/// - IPv4 addresses in private/reserved ranges
/// - IPv6 loopback, link-local, unique-local or IPv4-mapped private addresses
pub fn validate_target_url(raw: &str, block_private: bool) -> Result<Url, ProxyError> {
    let raw = raw.trim();
    let decoded = if starts_with_ignore_case(raw, "http%3a") || starts_with_ignore_case(raw, "https%3a") {
        urlencoding::decode(raw)
            .map_err(|_| ProxyError::InvalidTarget(format!("Invalid percent-encoding: {raw}")))?
            .into_owned()
    } else {
        raw.to_string()
    };

    let parsed = Url::parse(&decoded)
        .map_err(|_| ProxyError::InvalidTarget(format!("Invalid URL: {decoded}")))?;

    // Only allow HTTP(S)
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ProxyError::InvalidTarget(format!(
                "Scheme '{scheme}' not allowed, only http/https permitted"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| ProxyError::InvalidTarget(format!("No host in URL: {decoded}")))?;

    if block_private {
        match host {
            Host::Ipv4(ip) if is_blocked_ipv4(ip) => {
                return Err(ProxyError::InvalidTarget(format!(
                    "Private or reserved IPv4 address not allowed: {ip}"
                )));
            }
            Host::Ipv6(ip) if is_blocked_ipv6(ip) => {
                return Err(ProxyError::InvalidTarget(format!(
                    "Private or reserved IPv6 address not allowed: {ip}"
                )));
            }
            _ => {}
        }
    }

    Ok(parsed)
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Returns `true` for IPv4 addresses in private or reserved ranges.
///
/// Blocked ranges:
/// - `0.0.0.0/8`      — "this" network (RFC 1122)
/// - `10.0.0.0/8`     — RFC 1918 private
/// - `127.0.0.0/8`    — loopback
/// - `169.254.0.0/16` — link-local / cloud-metadata (AWS, GCP, Azure)
/// - `172.16.0.0/12`  — RFC 1918 private
/// - `192.168.0.0/16` — RFC 1918 private
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    let (a, b) = (octets[0], octets[1]);

    a == 0                               // 0.0.0.0/8
        || a == 10                       // 10.0.0.0/8
        || a == 127                      // 127.0.0.0/8 loopback
        || (a == 169 && b == 254)        // 169.254.0.0/16 link-local
        || (a == 172 && (16..=31).contains(&b)) // 172.16.0.0/12
        || (a == 192 && b == 168) // 192.168.0.0/16
}

/// Returns `true` for IPv6 addresses in private or reserved ranges.
///
/// Blocked ranges:
/// - `::1/128`, `::/128` — loopback, unspecified
/// - `fe80::/10`         — link-local
/// - `fc00::/7`          — unique-local (ULA)
/// - `::ffff:0:0/96`     — IPv4-mapped, checked as IPv4
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }

    let s = ip.segments();

    ip.is_loopback()                     // ::1
        || ip.is_unspecified()           // ::
        || (s[0] & 0xffc0) == 0xfe80    // fe80::/10 link-local
        || (s[0] & 0xfe00) == 0xfc00 // fc00::/7 unique-local
}
