//! FDSN federator HTTP service.
//!
//! Exposes `dataselect`, `station` and `wfcatalog` query endpoints under a
//! configurable base URL and answers each request by federating it over the
//! archive nodes returned by the routing service (see [`federator_core`]).

pub mod config;
pub mod error;
pub mod framing;
pub mod handlers;
pub mod models;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use federator_core::Transport;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

// ------------------------------------------------------------------ //
//  Shared application state                                           //
// ------------------------------------------------------------------ //

/// Shared state injected into every Axum handler via `State`.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Outbound HTTP used for routing and node requests.
    pub transport: Arc<dyn Transport>,
}

/// Assemble the service routes.
pub fn router(state: Arc<AppState>) -> Router {
    let services = Router::new()
        .route("/dataselect/query", get(handlers::dataselect_query))
        .route("/station/query", get(handlers::station_query))
        .route("/wfcatalog/query", get(handlers::wfcatalog_query))
        .route("/version", get(handlers::version))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            handlers::maintenance,
        ));

    let app = Router::new().route("/health", get(handlers::health));
    let app = if state.config.base_url.is_empty() {
        app.merge(services)
    } else {
        app.nest(&state.config.base_url, services)
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}
