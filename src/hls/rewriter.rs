//! Line-preserving playlist rewriter.
//!
//! Every URI a player would fetch is replaced with a link back to the proxy.
//! Lines are never added or removed, and on a rewritten line only the URI
//! value changes. Anything that cannot be resolved is left exactly as the
//! origin sent it.

use super::attributes::{find, parse_attributes, remove_attribute, replace_spans};
use super::tags::{Endpoint, RewriteStrategy, strategy_for, tag_name};
use super::variables::VariableTable;
use std::borrow::Cow;
use std::ops::Range;
use tracing::{debug, warn};
use url::Url;

/// Per-request inputs to a rewrite.
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    /// Final URL of the playlist; relative URIs resolve against it.
    pub playlist_url: &'a Url,
    /// Public base of the proxy, e.g. `https://relay.example/proxy`.
    pub proxy_base: &'a str,
    pub source_key: &'a str,
    pub allow_cors: bool,
}

/// Classification of one playlist line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestLine<'a> {
    Blank,
    Comment,
    Tag { name: &'a str },
    Uri,
}

impl<'a> ManifestLine<'a> {
    pub fn classify(line: &'a str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            Self::Blank
        } else if trimmed.starts_with('#') {
            match tag_name(trimmed) {
                Some(name) => Self::Tag { name },
                None => Self::Comment,
            }
        } else {
            Self::Uri
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    /// URIs replaced with proxy (or direct) links.
    pub rewritten: usize,
    /// Malformed `EXT-X-MEDIA` URIs removed.
    pub stripped: usize,
    /// URIs that could not be resolved and were kept verbatim.
    pub untouched: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenPlaylist {
    pub text: String,
    pub stats: RewriteStats,
}

/// Playlist rewritten from raw bytes. See [`rewrite_playlist_bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenBytes {
    pub body: Vec<u8>,
    pub stats: RewriteStats,
}

/// Rewrite a playlist so every referenced resource is fetched through the proxy.
pub fn rewrite_playlist(input: &str, ctx: &RewriteContext<'_>) -> RewrittenPlaylist {
    let mut playlist = PlaylistState::new(ctx);
    let mut out = String::with_capacity(input.len() + input.len() / 2);

    for (idx, raw) in input.split('\n').enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let (line, cr) = match raw.strip_suffix('\r') {
            Some(line) => (line, true),
            None => (raw, false),
        };

        out.push_str(&playlist.line(line));
        if cr {
            out.push('\r');
        }
    }

    let stats = playlist.finish();
    RewrittenPlaylist { text: out, stats }
}

/// Byte-level variant of [`rewrite_playlist`] for bodies as received.
///
/// A leading UTF-8 BOM is kept. Lines that are not valid UTF-8 (Latin-1
/// `NAME=` values are common) are read one byte per char and written back
/// the same way, so every byte outside a replaced URI survives unchanged.
pub fn rewrite_playlist_bytes(input: &[u8], ctx: &RewriteContext<'_>) -> RewrittenBytes {
    const BOM: &[u8] = b"\xEF\xBB\xBF";

    let (bom, input) = match input.strip_prefix(BOM) {
        Some(rest) => (BOM, rest),
        None => (&[][..], input),
    };

    let mut out = Vec::with_capacity(bom.len() + input.len() + input.len() / 2);
    out.extend_from_slice(bom);

    if let Ok(text) = std::str::from_utf8(input) {
        let rewritten = rewrite_playlist(text, ctx);
        out.extend_from_slice(rewritten.text.as_bytes());
        return RewrittenBytes {
            body: out,
            stats: rewritten.stats,
        };
    }

    debug!("Playlist {} is not valid UTF-8, rewriting per line", ctx.playlist_url);
    let mut playlist = PlaylistState::new(ctx);

    for (idx, raw) in input.split(|&b| b == b'\n').enumerate() {
        if idx > 0 {
            out.push(b'\n');
        }
        let (line, cr) = match raw.strip_suffix(b"\r") {
            Some(line) => (line, true),
            None => (raw, false),
        };

        match std::str::from_utf8(line) {
            Ok(line) => out.extend_from_slice(playlist.line(line).as_bytes()),
            Err(_) => {
                let decoded: String = line.iter().map(|&b| char::from(b)).collect();
                push_latin1(&mut out, &playlist.line(&decoded));
            }
        }
        if cr {
            out.push(b'\r');
        }
    }

    let stats = playlist.finish();
    RewrittenBytes { body: out, stats }
}

/// Inverse of the one-byte-per-char decode. Chars above U+00FF can only
/// come from inserted links and are written as UTF-8.
fn push_latin1(out: &mut Vec<u8>, text: &str) {
    for c in text.chars() {
        match u8::try_from(c) {
            Ok(b) => out.push(b),
            Err(_) => out.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
        }
    }
}

/// State carried from line to line within one playlist.
struct PlaylistState<'c, 'a> {
    rewriter: LineRewriter<'c, 'a>,
    variables: VariableTable,
    variant_pending: bool,
}

impl<'c, 'a> PlaylistState<'c, 'a> {
    fn new(ctx: &'c RewriteContext<'a>) -> Self {
        Self {
            rewriter: LineRewriter {
                ctx,
                stats: RewriteStats::default(),
            },
            variables: VariableTable::new(),
            variant_pending: false,
        }
    }

    fn line<'l>(&mut self, line: &'l str) -> Cow<'l, str> {
        match ManifestLine::classify(line) {
            ManifestLine::Blank | ManifestLine::Comment => Cow::Borrowed(line),
            ManifestLine::Tag { name } => match strategy_for(name) {
                RewriteStrategy::Define => {
                    let attributes = parse_attributes(line);
                    match self
                        .variables
                        .define_from_tag(&attributes, self.rewriter.ctx.playlist_url)
                    {
                        Ok(defined) => debug!("EXT-X-DEFINE {}", defined),
                        Err(e) => warn!("Ignoring {}", e),
                    }
                    Cow::Borrowed(line)
                }
                RewriteStrategy::VariantStream => {
                    self.variant_pending = true;
                    Cow::Borrowed(line)
                }
                strategy => self.rewriter.tag(line, strategy, &self.variables),
            },
            ManifestLine::Uri => {
                let endpoint = if std::mem::take(&mut self.variant_pending) {
                    Endpoint::Playlist
                } else {
                    Endpoint::Segment
                };
                self.rewriter.uri_line(line, endpoint, &self.variables)
            }
        }
    }

    fn finish(self) -> RewriteStats {
        let stats = self.rewriter.stats;
        debug!(
            "Playlist rewritten: {} URIs proxied, {} stripped, {} left untouched",
            stats.rewritten, stats.stripped, stats.untouched
        );
        stats
    }
}

struct LineRewriter<'c, 'a> {
    ctx: &'c RewriteContext<'a>,
    stats: RewriteStats,
}

impl LineRewriter<'_, '_> {
    fn uri_line<'l>(&mut self, line: &'l str, endpoint: Endpoint, vars: &VariableTable) -> Cow<'l, str> {
        let start = line.len() - line.trim_start().len();
        let end = line.trim_end().len();

        match self.link_for(&line[start..end], endpoint, vars) {
            Some(link) => Cow::Owned(replace_spans(line, &[(start..end, link)])),
            None => Cow::Borrowed(line),
        }
    }

    fn tag<'l>(&mut self, line: &'l str, strategy: RewriteStrategy, vars: &VariableTable) -> Cow<'l, str> {
        match strategy {
            RewriteStrategy::UriAttribute { attribute, endpoint } => {
                let attributes = parse_attributes(line);
                let Some(attr) = find(&attributes, attribute) else {
                    return Cow::Borrowed(line);
                };
                self.replace_value(line, attr.value_span.clone(), attr.value, endpoint, vars)
            }

            RewriteStrategy::AlternateMedia => {
                let attributes = parse_attributes(line);
                let Some(attr) = find(&attributes, "URI") else {
                    return Cow::Borrowed(line);
                };
                let value = attr.value.trim();
                if value.is_empty() || value.eq_ignore_ascii_case("nan") {
                    debug!("Stripping malformed EXT-X-MEDIA URI {:?}", attr.value);
                    self.stats.stripped += 1;
                    return Cow::Owned(remove_attribute(line, attr));
                }
                self.replace_value(line, attr.value_span.clone(), attr.value, Endpoint::Playlist, vars)
            }

            RewriteStrategy::DateRange => {
                let attributes = parse_attributes(line);
                let mut replacements = Vec::new();

                for attr in attributes.iter().filter(|a| a.quoted && looks_like_link(a.name, a.value)) {
                    let endpoint = if attr.value.trim_end().ends_with(".m3u8") {
                        Endpoint::Playlist
                    } else {
                        Endpoint::Segment
                    };
                    if let Some(link) = self.link_for(attr.value, endpoint, vars) {
                        replacements.push((attr.value_span.clone(), link));
                    }
                }

                if replacements.is_empty() {
                    Cow::Borrowed(line)
                } else {
                    Cow::Owned(replace_spans(line, &replacements))
                }
            }

            RewriteStrategy::VariantStream | RewriteStrategy::Define | RewriteStrategy::Passthrough => {
                Cow::Borrowed(line)
            }
        }
    }

    fn replace_value<'l>(
        &mut self,
        line: &'l str,
        span: Range<usize>,
        value: &str,
        endpoint: Endpoint,
        vars: &VariableTable,
    ) -> Cow<'l, str> {
        match self.link_for(value, endpoint, vars) {
            Some(link) => Cow::Owned(replace_spans(line, &[(span, link)])),
            None => Cow::Borrowed(line),
        }
    }

    /// Substitute, resolve and build the outgoing link for one URI.
    ///
    /// `None` means the URI stays as it is.
    fn link_for(&mut self, raw: &str, endpoint: Endpoint, vars: &VariableTable) -> Option<String> {
        let substituted = vars.substitute(raw.trim());
        if !substituted.unresolved.is_empty() {
            warn!(
                "Undefined playlist variable(s) {:?} in {:?}, leaving URI untouched",
                substituted.unresolved, raw
            );
            self.stats.untouched += 1;
            return None;
        }

        let target = match self.ctx.playlist_url.join(&substituted.text) {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot resolve URI {:?} against {}: {}", raw, self.ctx.playlist_url, e);
                self.stats.untouched += 1;
                return None;
            }
        };

        if !matches!(target.scheme(), "http" | "https") {
            // skd://, data: and friends are handled by the player itself.
            debug!("Keeping {} URI as-is", target.scheme());
            self.stats.untouched += 1;
            return None;
        }

        self.stats.rewritten += 1;
        Some(self.ctx.link(&target, endpoint))
    }
}

impl RewriteContext<'_> {
    /// Outgoing link for a resolved target.
    ///
    /// With `allow_cors`, https media is linked directly and only playlists
    /// keep going through the proxy.
    pub fn link(&self, target: &Url, endpoint: Endpoint) -> String {
        if self.allow_cors && !endpoint.is_playlist() && target.scheme() == "https" {
            return target.to_string();
        }

        let mut link = format!(
            "{}/{}?url={}&source={}",
            self.proxy_base.trim_end_matches('/'),
            endpoint.path(),
            urlencoding::encode(target.as_str()),
            urlencoding::encode(self.source_key),
        );
        if self.allow_cors && endpoint.is_playlist() {
            link.push_str("&allowCORS=true");
        }
        link
    }
}

/// Heuristic for `EXT-X-DATERANGE` values that reference a resource.
fn looks_like_link(name: &str, value: &str) -> bool {
    const EXTENSIONS: &[&str] = &[
        ".m3u8", ".ts", ".mp4", ".m4s", ".aac", ".vtt", ".webvtt", ".json", ".key",
    ];

    if matches!(name, "ID" | "CLASS" | "START-DATE" | "END-DATE") {
        return false;
    }

    let value = value.trim();
    if value.is_empty() || value.contains(char::is_whitespace) {
        return false;
    }

    let lower = value.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return true;
    }
    if value.starts_with('/') || value.starts_with("./") || value.starts_with("../") {
        return true;
    }

    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
