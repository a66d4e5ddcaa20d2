use crate::collectors::{sample_blocking, MetricsSource};
use crate::metrics::Metrics;
use crate::sink::{Sink, SinkHealth};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub source: Arc<dyn MetricsSource>,
    pub sink: Option<Arc<dyn Sink>>,
    pub metrics: Arc<Metrics>,
    pub collection_interval: Duration,
    pub io_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sink: &'static str,
    /// Seconds between collections.
    pub collection_interval: u64,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/metrics", get(snapshot_handler))
        .route("/send", post(send_handler))
        .route("/health", get(health_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        .with_state(state)
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Response {
    match sample_blocking(&state.source).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => {
            error!(error = %err, "failed to sample metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn send_handler(State(state): State<HttpAppState>) -> Json<SendResponse> {
    let success = send_now(&state).await;
    let message = if success {
        "Metrics sent to InfluxDB"
    } else {
        "Failed to send metrics"
    };
    Json(SendResponse {
        success,
        message: message.to_string(),
    })
}

async fn send_now(state: &HttpAppState) -> bool {
    let Some(sink) = &state.sink else {
        warn!("send requested but no sink is configured");
        return false;
    };

    let snapshot = match sample_blocking(&state.source).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(error = %err, "failed to sample metrics for send");
            return false;
        }
    };
    state.metrics.update_from_snapshot(&snapshot);

    match timeout(state.io_timeout, sink.write(&snapshot)).await {
        Ok(Ok(())) => {
            state.metrics.inc_sink_write("ok");
            true
        }
        Ok(Err(err)) => {
            state.metrics.inc_sink_write("error");
            warn!(error = %err, "manual sink write failed");
            false
        }
        Err(_) => {
            state.metrics.inc_sink_write("timeout");
            warn!("manual sink write timed out");
            false
        }
    }
}

async fn health_handler(State(state): State<HttpAppState>) -> Json<HealthResponse> {
    let sink = match &state.sink {
        Some(sink) => timeout(state.io_timeout, sink.health())
            .await
            .unwrap_or(SinkHealth::Disconnected),
        None => SinkHealth::NotConfigured,
    };
    Json(HealthResponse {
        status: "healthy",
        sink: sink.as_str(),
        collection_interval: state.collection_interval.as_secs(),
    })
}

async fn prometheus_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
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
