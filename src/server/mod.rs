pub mod handlers;
pub mod public_base;
pub mod state;
pub mod url_validation;

use crate::config::Config;
use crate::error::StartupError;
use crate::metrics;
use axum::{
    Router,
    http::{HeaderName, HeaderValue, header},
    routing::get,
};
use handlers::{health, manifest, preflight, segment};
use state::AppState;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const ALLOW_METHODS: &str = "GET, HEAD, OPTIONS";
const ALLOW_HEADERS: &str = "Range, Content-Type, Origin, Accept";
const EXPOSE_HEADERS: &str = "Content-Length, Content-Range, Content-Type, Accept-Ranges, ETag";

/// Build the router with state derived from `config`.
pub fn build_router(config: Config) -> Result<Router, StartupError> {
    Ok(build_router_with_state(AppState::new(config)?))
}

/// Build the router around existing state (tests inspect the pool through it).
pub fn build_router_with_state(state: AppState) -> Router {
    metrics::init();

    Router::new()
        .route("/", get(health::health_check))
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics_handler))
        .route("/proxy/m3u8", get(manifest::serve_manifest).options(preflight))
        .route("/proxy/segment", get(segment::serve_segment).options(preflight))
        .route("/proxy/key", get(segment::serve_key).options(preflight))
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSE_HEADERS),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-relay-version"),
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), StartupError> {
    let addr = format!("0.0.0.0:{}", config.port);
    let app = build_router(config)?;

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
