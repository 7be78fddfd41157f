use crate::{AppState, SERVICE_NAME};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use nova_metrics::Sample;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// 单条或批量写入
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Batch(Vec<Sample>),
    Single(Sample),
}

impl IngestRequest {
    fn into_samples(self) -> Vec<Sample> {
        match self {
            IngestRequest::Batch(samples) => samples,
            IngestRequest::Single(sample) => vec![sample],
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/metrics", get(get_metrics))
        .route("/api/alerts", get(get_alerts))
        .route("/api/alerts/history", get(get_alert_history))
        .route("/api/status", get(get_status))
        .route("/api/ingest", post(ingest))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/health",
            "metrics": "/api/metrics",
            "alerts": "/api/alerts",
            "alert_history": "/api/alerts/history",
            "status": "/api/status",
            "ingest": "/api/ingest",
            "prometheus": "/metrics",
        }
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.monitor.snapshot().await;

    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": snapshot.taken_at,
        "uptime_seconds": state.uptime_seconds(),
        "ingest": snapshot.ingest,
        "store": snapshot.store,
        "system": state.system.sample(),
    }))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.monitor.snapshot().await;

    Json(json!({
        "metrics": snapshot.metrics_map(),
        "timestamp": snapshot.taken_at,
    }))
}

async fn get_alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.monitor.snapshot().await;

    Json(json!({
        "alerts": snapshot.active_alerts,
        "total": snapshot.alert_counts.total(),
        "active": snapshot.alert_counts.active(),
        "timestamp": snapshot.taken_at,
    }))
}

async fn get_alert_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let since = query.since.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let history = state.monitor.registry().history(since).await;

    Json(json!({
        "alerts": history,
        "count": history.len(),
        "since": query.since,
    }))
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.monitor.snapshot().await;
    let status = if snapshot.evaluator.last_evaluation.is_some() {
        "running"
    } else {
        "starting"
    };

    Json(json!({
        "service": SERVICE_NAME,
        "status": status,
        "monitors_count": snapshot.monitors_count(),
        "series_count": snapshot.series_count(),
        "active_alerts": snapshot.alert_counts.active(),
        "last_check": snapshot.evaluator.last_evaluation,
        "uptime_seconds": state.uptime_seconds(),
        "timestamp": snapshot.taken_at,
    }))
}

/// 被拒绝的样本体现在计数里，不是 HTTP 错误
async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> impl IntoResponse {
    let report = state.monitor.ingest_batch(request.into_samples());
    debug!(
        accepted = report.accepted,
        rejected = report.rejected,
        dropped = report.dropped_out_of_order,
        "Ingest request handled"
    );

    (StatusCode::OK, Json(report))
}

async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.monitor.snapshot().await;

    match state.telemetry.render(&snapshot, state.uptime_seconds()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            body,
        ),
        Err(e) => {
            error!("Failed to render Prometheus metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
                e.to_string(),
            )
        }
    }
}
