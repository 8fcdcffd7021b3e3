use crate::metrics::Metrics;
use crate::report::LatencyReport;
use crate::state::State as FleetState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<FleetState>>,
    pub refresh: Arc<Notify>,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: Arc<RwLock<FleetState>>,
    refresh: Arc<Notify>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/latency", get(latency_handler))
        .route("/api/refresh", post(refresh_handler))
        .with_state(HttpAppState {
            metrics,
            state,
            refresh,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    {
        let guard = state.state.read().await;
        state.metrics.update_from_state(&guard);
    }
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Response {
    let guard = state.state.read().await;
    match &guard.last_snapshot {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_collected_yet(),
    }
}

async fn latency_handler(State(state): State<HttpAppState>) -> Response {
    let guard = state.state.read().await;
    match &guard.last_snapshot {
        Some(snapshot) => Json(LatencyReport::from_snapshot(
            snapshot,
            Duration::from_millis(guard.last_cycle_elapsed_ms),
        ))
        .into_response(),
        None => not_collected_yet(),
    }
}

async fn refresh_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    state.metrics.inc_refresh_request();
    state.refresh.notify_one();
    (StatusCode::ACCEPTED, "refresh scheduled")
}

fn not_collected_yet() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "no collection cycle has completed yet",
    )
        .into_response()
}
