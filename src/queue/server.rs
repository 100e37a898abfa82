//! # Work Queue Server
//!
//! HTTP wire protocol over the in-process [`WorkQueue`]:
//!
//! - `POST /v1/queue/push` - enqueue a stack (called by the reconciler).
//!   Responds 202 with the chosen shard; blocks while the shard is full.
//! - `GET /v1/queue/poll/{shard}` - dequeue one stack (called by a worker).
//!   200 with the stack, 204 when the shard is empty, 400 on a bad shard.
//! - `/healthz`, `/readyz`, `/metrics` - probes and Prometheus metrics.

use crate::crd::TerraformStack;
use crate::metrics;
use crate::queue::WorkQueue;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kube::ResourceExt;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct QueueServerState {
    pub queue: WorkQueue,
}

pub fn router(state: Arc<QueueServerState>) -> Router {
    Router::new()
        .route("/v1/queue/push", post(push_handler))
        .route("/v1/queue/poll/{shard}", get(poll_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(port: u16, state: Arc<QueueServerState>) -> Result<(), anyhow::Error> {
    let app = router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Queue server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn push_handler(
    State(state): State<Arc<QueueServerState>>,
    Json(stack): Json<TerraformStack>,
) -> impl IntoResponse {
    let name = stack.name_any();
    match state.queue.push(stack).await {
        Ok(shard) => {
            metrics::increment_queue_pushes();
            debug!("Enqueued stack {} on shard {}", name, shard);
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "shard": shard })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to enqueue stack {}: {:#}", name, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn poll_handler(
    State(state): State<Arc<QueueServerState>>,
    Path(shard): Path<usize>,
) -> impl IntoResponse {
    if shard >= state.queue.shard_count() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("shard {} out of range (shard count {})", shard, state.queue.shard_count())
            })),
        )
            .into_response();
    }
    metrics::increment_queue_polls();
    match state.queue.poll(shard).await {
        Ok(Some(stack)) => (StatusCode::OK, Json(stack)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Poll failed on shard {}: {:#}", shard, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}
