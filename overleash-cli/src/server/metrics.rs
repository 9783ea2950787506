use std::sync::OnceLock;
use std::time::Instant;

use axum::extract::MatchedPath;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::error;

/// Global metrics registry
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// All application metrics
pub struct Metrics {
    // HTTP request metrics
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,

    // SSE metrics
    pub sse_active: IntGauge,
    pub sse_total: IntCounter,
    pub sse_events: IntCounterVec,

    // Mirror metrics
    pub override_changes: IntCounterVec,
    pub refresh_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn new(registry: &Registry) -> Self {
        // ── HTTP request metrics ──────────────────────────────────────
        let http_requests_total = IntCounterVec::new(
            Opts::new("overleash_http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )
        .expect("failed to create http_requests_total metric");

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "overleash_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["method", "path"],
        )
        .expect("failed to create http_request_duration metric");

        // ── SSE metrics ──────────────────────────────────────────────
        let sse_active = IntGauge::new(
            "overleash_sse_active_connections",
            "Number of open streaming connections",
        )
        .expect("failed to create sse_active metric");

        let sse_total = IntCounter::new(
            "overleash_sse_connections_total",
            "Total number of streaming connections",
        )
        .expect("failed to create sse_total metric");

        let sse_events = IntCounterVec::new(
            Opts::new("overleash_sse_events_total", "Total number of streamed events"),
            &["type"],
        )
        .expect("failed to create sse_events metric");

        // ── Mirror metrics ───────────────────────────────────────────
        let override_changes = IntCounterVec::new(
            Opts::new("overleash_override_changes_total", "Override and pause changes made through the API"),
            &["action"],
        )
        .expect("failed to create override_changes metric");

        let refresh_total = IntCounterVec::new(
            Opts::new("overleash_refresh_total", "Manually triggered refreshes"),
            &["trigger", "result"],
        )
        .expect("failed to create refresh_total metric");

        registry.register(Box::new(http_requests_total.clone())).expect("register http_requests_total");
        registry.register(Box::new(http_request_duration.clone())).expect("register http_request_duration");
        registry.register(Box::new(sse_active.clone())).expect("register sse_active");
        registry.register(Box::new(sse_total.clone())).expect("register sse_total");
        registry.register(Box::new(sse_events.clone())).expect("register sse_events");
        registry.register(Box::new(override_changes.clone())).expect("register override_changes");
        registry.register(Box::new(refresh_total.clone())).expect("register refresh_total");

        Self {
            http_requests_total,
            http_request_duration,
            sse_active,
            sse_total,
            sse_events,
            override_changes,
            refresh_total,
        }
    }
}

/// Get the global metrics instance, initializing on first call
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = REGISTRY.get_or_init(Registry::new);
        Metrics::new(registry)
    })
}

/// Axum handler for GET /metrics, in Prometheus text format
pub async fn handle_metrics() -> Response {
    let _ = metrics();
    let registry = REGISTRY.get_or_init(Registry::new);
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "unable to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Axum middleware that records HTTP request count and duration.
pub async fn track_metrics(request: Request<axum::body::Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let m = metrics();
    m.http_requests_total
        .with_label_values(&[&method, &path, &status])
        .inc();
    m.http_request_duration
        .with_label_values(&[&method, &path])
        .observe(elapsed);

    response
}
