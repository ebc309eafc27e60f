//! Tag name → rewrite strategy table.
//!
//! Supporting a new URI-bearing tag is a new row here, not a new branch in
//! the rewriter.

/// Proxy endpoint a rewritten URI is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `/proxy/segment`: media segments, init sections, parts, session data.
    Segment,
    /// `/proxy/key`: encryption keys.
    Key,
    /// `/proxy/m3u8`: other playlists.
    Playlist,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::Segment => "segment",
            Self::Key => "key",
            Self::Playlist => "m3u8",
        }
    }

    /// Whether links to this endpoint carry the inbound `allowCORS` flag.
    pub fn is_playlist(self) -> bool {
        matches!(self, Self::Playlist)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteStrategy {
    /// Rewrite the value of one named attribute.
    UriAttribute {
        attribute: &'static str,
        endpoint: Endpoint,
    },
    /// `EXT-X-MEDIA`: like `UriAttribute` to the playlist endpoint, but an
    /// empty or `nan` URI is stripped.
    AlternateMedia,
    /// `EXT-X-DATERANGE`: every quoted attribute that looks like a link.
    DateRange,
    /// `EXT-X-STREAM-INF`: tag verbatim, next URI line is a variant playlist.
    VariantStream,
    /// `EXT-X-DEFINE`: tag verbatim, updates the variable table.
    Define,
    /// No URI semantics.
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRule {
    pub name: &'static str,
    pub strategy: RewriteStrategy,
}

const fn uri(name: &'static str, endpoint: Endpoint) -> TagRule {
    TagRule {
        name,
        strategy: RewriteStrategy::UriAttribute {
            attribute: "URI",
            endpoint,
        },
    }
}

const fn rule(name: &'static str, strategy: RewriteStrategy) -> TagRule {
    TagRule { name, strategy }
}

pub const TAG_RULES: &[TagRule] = &[
    uri("EXT-X-MAP", Endpoint::Segment),
    uri("EXT-X-PART", Endpoint::Segment),
    uri("EXT-X-SESSION-DATA", Endpoint::Segment),
    uri("EXT-X-PRELOAD-HINT", Endpoint::Segment),
    uri("EXT-X-KEY", Endpoint::Key),
    uri("EXT-X-SESSION-KEY", Endpoint::Key),
    uri("EXT-X-RENDITION-REPORT", Endpoint::Playlist),
    uri("EXT-X-I-FRAME-STREAM-INF", Endpoint::Playlist),
    rule(
        "EXT-X-CONTENT-STEERING",
        RewriteStrategy::UriAttribute {
            attribute: "SERVER-URI",
            endpoint: Endpoint::Playlist,
        },
    ),
    rule("EXT-X-MEDIA", RewriteStrategy::AlternateMedia),
    rule("EXT-X-DATERANGE", RewriteStrategy::DateRange),
    rule("EXT-X-STREAM-INF", RewriteStrategy::VariantStream),
    rule("EXT-X-DEFINE", RewriteStrategy::Define),
    rule("EXT-X-SERVER-CONTROL", RewriteStrategy::Passthrough),
    rule("EXT-X-SKIP", RewriteStrategy::Passthrough),
];

/// Name of the tag on a `#`-prefixed line, without the `#` and attributes.
///
/// Returns `None` for plain comments (lines not starting with `#EXT`).
pub fn tag_name(line: &str) -> Option<&str> {
    let body = line.strip_prefix('#')?;
    if !body.starts_with("EXT") {
        return None;
    }
    let end = body.find(':').unwrap_or(body.len());
    Some(body[..end].trim_end())
}

/// Strategy for a tag; unknown tags pass through.
pub fn strategy_for(name: &str) -> RewriteStrategy {
    TAG_RULES
        .iter()
        .find(|r| r.name == name)
        .map_or(RewriteStrategy::Passthrough, |r| r.strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names() {
        assert_eq!(tag_name("#EXTM3U"), Some("EXTM3U"));
        assert_eq!(tag_name("#EXT-X-KEY:METHOD=NONE"), Some("EXT-X-KEY"));
        assert_eq!(tag_name("#EXT-X-ENDLIST"), Some("EXT-X-ENDLIST"));
        assert_eq!(tag_name("# just a comment"), None);
        assert_eq!(tag_name("seg1.ts"), None);
    }

    #[test]
    fn prefix_tags_do_not_collide() {
        // EXT-X-PART vs EXT-X-PART-INF, EXT-X-STREAM-INF vs EXT-X-I-FRAME-STREAM-INF
        assert_eq!(strategy_for("EXT-X-PART-INF"), RewriteStrategy::Passthrough);
        assert_eq!(strategy_for("EXT-X-STREAM-INF"), RewriteStrategy::VariantStream);
        assert!(matches!(
            strategy_for("EXT-X-I-FRAME-STREAM-INF"),
            RewriteStrategy::UriAttribute {
                endpoint: Endpoint::Playlist,
                ..
            }
        ));
    }

    #[test]
    fn routing_table() {
        let cases = [
            ("EXT-X-MAP", "URI", Endpoint::Segment),
            ("EXT-X-PART", "URI", Endpoint::Segment),
            ("EXT-X-SESSION-DATA", "URI", Endpoint::Segment),
            ("EXT-X-PRELOAD-HINT", "URI", Endpoint::Segment),
            ("EXT-X-KEY", "URI", Endpoint::Key),
            ("EXT-X-SESSION-KEY", "URI", Endpoint::Key),
            ("EXT-X-RENDITION-REPORT", "URI", Endpoint::Playlist),
            ("EXT-X-CONTENT-STEERING", "SERVER-URI", Endpoint::Playlist),
        ];

        for (tag, attr, ep) in cases {
            assert_eq!(
                strategy_for(tag),
                RewriteStrategy::UriAttribute {
                    attribute: attr,
                    endpoint: ep
                },
                "{tag}"
            );
        }
    }

    #[test]
    fn unknown_and_control_tags_pass_through() {
        for tag in ["EXT-X-SERVER-CONTROL", "EXT-X-SKIP", "EXTINF", "EXT-X-VENDOR-THING"] {
            assert_eq!(strategy_for(tag), RewriteStrategy::Passthrough, "{tag}");
        }
    }

    #[test]
    fn endpoint_paths() {
        assert_eq!(Endpoint::Segment.path(), "segment");
        assert_eq!(Endpoint::Key.path(), "key");
        assert_eq!(Endpoint::Playlist.path(), "m3u8");
    }
}
