//! Route table and shared application state.

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::engine::OidcEngine;

use super::handlers;

/// Shared application state.
pub struct AppState {
    /// The protocol engine every handler drives.
    pub engine: Arc<OidcEngine>,
}

/// Build the router over `state`.
///
/// CORS is permissive: relying parties fetch discovery and JWKS documents
/// cross-origin during development, which is the whole point of this
/// provider.
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(handlers::discovery),
        )
        .route("/jwks", get(handlers::jwks))
        .route("/authorize", get(handlers::authorize))
        .route("/interaction/{id}", get(handlers::interaction))
        .route("/token", post(handlers::token))
        .route("/userinfo", get(handlers::userinfo))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(TimeoutLayer::new(server.request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
