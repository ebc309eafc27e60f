//! HLS playlist rewriting.
//!
//! The rewriter works on raw text instead of a parsed model: parsers drop
//! tags they don't know and reformat the ones they do, while players expect
//! the origin's playlist byte for byte apart from the URIs.

pub mod attributes;
pub mod rewriter;
pub mod tags;
pub mod variables;

pub use rewriter::{
    ManifestLine, RewriteContext, RewriteStats, RewrittenBytes, RewrittenPlaylist, rewrite_playlist,
    rewrite_playlist_bytes,
};
pub use tags::Endpoint;
pub use variables::VariableTable;

/// Whether a body looks like an M3U playlist.
///
/// Leading UTF-8 BOM and whitespace are ignored.
pub fn is_playlist(body: &[u8]) -> bool {
    strip_bom(body).trim_ascii_start().starts_with(b"#EXTM3U")
}

/// Drop a leading UTF-8 byte order mark.
pub fn strip_bom(body: &[u8]) -> &[u8] {
    body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body)
}
