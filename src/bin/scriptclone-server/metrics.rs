use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts as PromOpts, Registry,
    TextEncoder,
};
use scriptclone::Stage;

struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_in_flight_requests: IntGauge,
    stage_runs_total: IntCounterVec,
    sessions_active: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build() -> prometheus::Result<Metrics> {
    let registry = Registry::new();

    let http_requests_total = IntCounterVec::new(
        PromOpts::new(
            "scriptclone_http_requests_total",
            "Total HTTP requests served by scriptclone-server.",
        ),
        &["route", "status"],
    )?;

    let http_request_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "scriptclone_http_request_duration_seconds",
            "HTTP request latency in seconds.",
        ),
        &["route", "status"],
    )?;

    let http_in_flight_requests = IntGauge::new(
        "scriptclone_http_in_flight_requests",
        "Current number of in-flight HTTP requests.",
    )?;

    let stage_runs_total = IntCounterVec::new(
        PromOpts::new(
            "scriptclone_stage_runs_total",
            "Stage calls made against the generation service.",
        ),
        &["stage", "outcome"],
    )?;

    let sessions_active = IntGauge::new(
        "scriptclone_sessions_active",
        "Number of sessions currently held in memory.",
    )?;

    registry.register(Box::new(http_requests_total.clone()))?;
    registry.register(Box::new(http_request_duration_seconds.clone()))?;
    registry.register(Box::new(http_in_flight_requests.clone()))?;
    registry.register(Box::new(stage_runs_total.clone()))?;
    registry.register(Box::new(sessions_active.clone()))?;

    Ok(Metrics {
        registry,
        http_requests_total,
        http_request_duration_seconds,
        http_in_flight_requests,
        stage_runs_total,
        sessions_active,
    })
}

/// Register all collectors. Until this succeeds, recording is a no-op.
pub fn init() -> prometheus::Result<()> {
    if METRICS.get().is_none() {
        let _ = METRICS.set(build()?);
    }
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

pub fn record_stage(stage: Stage, succeeded: bool) {
    if let Some(m) = metrics() {
        let stage = stage.to_string();
        let outcome = if succeeded { "ok" } else { "failed" };
        m.stage_runs_total
            .with_label_values(&[stage.as_str(), outcome])
            .inc();
    }
}

pub fn set_sessions(count: usize) {
    if let Some(m) = metrics() {
        m.sessions_active.set(count as i64);
    }
}

pub async fn prometheus_metrics() -> Response {
    let Some(m) = metrics() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response();
    };

    let families = m.registry.gather();
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&families, &mut buf).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        )],
        buf,
    )
        .into_response()
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str())
        .unwrap_or_else(|| req.uri().path())
        .to_owned();

    let Some(m) = metrics() else {
        return next.run(req).await;
    };
    if route == "/metrics" || route == "/healthz" {
        return next.run(req).await;
    }

    let start = Instant::now();

    m.http_in_flight_requests.inc();
    let response = next.run(req).await;
    m.http_in_flight_requests.dec();

    let status = response.status().as_u16().to_string();
    m.http_requests_total
        .with_label_values(&[route.as_str(), status.as_str()])
        .inc();
    m.http_request_duration_seconds
        .with_label_values(&[route.as_str(), status.as_str()])
        .observe(start.elapsed().as_secs_f64());

    response
}
