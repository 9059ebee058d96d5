//! Axum router construction.

use axum::{middleware::from_fn_with_state, routing::get, Router};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
///
/// Only the API routes run under [`middleware::trace_request`]; `/health`
/// and unknown paths produce no telemetry.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::home))
        .route("/api/users", get(handlers::users))
        .route("/api/orders", get(handlers::orders))
        .route("/api/slow", get(handlers::slow))
        .route("/error", get(handlers::error))
        .route_layer(from_fn_with_state(state.clone(), middleware::trace_request))
        .route("/health", get(handlers::health))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .with_state(state)
}
