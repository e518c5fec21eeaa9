//! Prometheus metrics for s3gate.
//!
//! All collectors are atomics behind an `Arc`, so `Metrics` is cheap to clone
//! into body streams and background tasks.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use prometheus::core::Collector;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder, TEXT_FORMAT,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    pub build_info: GaugeVec,

    // -- HTTP --
    pub requests_total: IntCounterVec,
    pub requests_in_progress: IntGauge,
    pub request_duration_seconds: HistogramVec,

    // -- Traffic --
    pub upload_bytes_total: IntCounter,
    pub download_bytes_total: IntCounter,
    pub archive_entries_total: IntCounter,

    // -- Auth --
    pub auth_failures_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a freshly built collector. Names are static, so a failure here
/// is a programming error.
fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric names are unique");
    collector
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        let build_info = register(
            &registry,
            GaugeVec::new(
                Opts::new("s3gate_build_info", "Build information"),
                &["version", "build_time"],
            )
            .expect("valid metric"),
        );
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION"), env!("S3GATE_BUILD_TIME")])
            .set(1.0);

        let requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("s3gate_requests_total", "Requests by method and status"),
                &["method", "status"],
            )
            .expect("valid metric"),
        );
        let requests_in_progress = register(
            &registry,
            IntGauge::new(
                "s3gate_requests_in_progress",
                "Requests whose response headers are not sent yet",
            )
            .expect("valid metric"),
        );
        let request_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "s3gate_request_duration_seconds",
                    "Time to response headers in seconds",
                ),
                &["method"],
            )
            .expect("valid metric"),
        );

        let upload_bytes_total = register(
            &registry,
            IntCounter::new(
                "s3gate_upload_bytes_total",
                "Request body bytes streamed to backends",
            )
            .expect("valid metric"),
        );
        let download_bytes_total = register(
            &registry,
            IntCounter::new(
                "s3gate_download_bytes_total",
                "Response body bytes streamed to clients",
            )
            .expect("valid metric"),
        );
        let archive_entries_total = register(
            &registry,
            IntCounter::new(
                "s3gate_archive_entries_total",
                "Objects written into ZIP downloads",
            )
            .expect("valid metric"),
        );

        let auth_failures_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("s3gate_auth_failures_total", "Rejected requests by kind"),
                &["reason"],
            )
            .expect("valid metric"),
        );

        Metrics {
            registry,
            build_info,
            requests_total,
            requests_in_progress,
            request_duration_seconds,
            upload_bytes_total,
            download_bytes_total,
            archive_entries_total,
            auth_failures_total,
        }
    }
}

/// Bounded method label; anything unusual is lumped together.
pub fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::HEAD => "HEAD",
        Method::PUT => "PUT",
        Method::POST => "POST",
        Method::DELETE => "DELETE",
        Method::PATCH => "PATCH",
        Method::OPTIONS => "OPTIONS",
        _ => "OTHER",
    }
}

/// Axum middleware that records request counts and latency.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = &state.metrics;
    let method = method_label(request.method());

    metrics.requests_in_progress.inc();
    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();
    metrics.requests_in_progress.dec();

    metrics
        .requests_total
        .with_label_values(&[method, response.status().as_str()])
        .inc();
    metrics
        .request_duration_seconds
        .with_label_values(&[method])
        .observe(duration);

    response
}

/// GET /metrics, Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub build_time: &'static str,
    pub mode: String,
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        build_time: env!("S3GATE_BUILD_TIME"),
        mode: state.mode.to_string(),
    })
}
