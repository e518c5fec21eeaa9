//! HTTP surface: the proxy router and the monitoring router

mod archive;
mod auth;
pub mod classify;
mod errors;
pub mod forward;
pub mod handlers;
pub mod policy;
mod xml;

pub use errors::{ProxyError, ERROR_HEADER};
pub use handlers::{AppState, StartupError};

use crate::metrics;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Router for proxied traffic. Every path goes to the proxy handler;
/// bucket names are not known up front.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handlers::proxy_handler)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics::http_metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for `/metrics` and `/health`, served on a separate listener so
/// those paths never shadow a bucket.
pub fn monitoring_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .route("/health", get(metrics::health_handler))
        .with_state(state)
}
