//! hls-relay: an HLS rewriting reverse proxy.
//!
//! Fetches playlists from third-party origins, rewrites every embedded URI so
//! the player comes back through the proxy, and streams segments and keys with
//! bounded buffering.

pub mod config;
pub mod error;
pub mod hls;
pub mod metrics;
pub mod server;
pub mod source;
pub mod streaming;
pub mod upstream;
