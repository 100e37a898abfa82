//! # HTTP Server
//!
//! Controller-side HTTP server for probes, metrics, and the synchronous
//! on-demand apply path.
//!
//! Provides endpoints:
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - Liveness probe (always returns 200)
//! - `/readyz` - Readiness probe (returns 200 when the controller is ready)
//! - `POST /v1/stacks/{namespace}/{name}/apply` - resolve the latest commit
//!   and run plan + apply immediately through the shared stack handler.
//!
//! The apply route bypasses the work queue: it does not participate in
//! shard affinity and can overlap with a queue-driven run of the same stack.

use crate::annotations::SyncCommand;
use crate::crd::{ApplyHistory, OperationPhase, TerraformStack};
use crate::handler::records::RecordStore;
use crate::handler::StackHandler;
use crate::metrics;
use crate::repository::Repository;
use crate::worker;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kube::{Api, Client};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct ServerState {
    pub is_ready: Arc<std::sync::atomic::AtomicBool>,
    pub client: Client,
    pub handler: Arc<dyn StackHandler>,
    pub repository: Arc<dyn Repository>,
    pub records: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState").finish()
    }
}

pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/v1/stacks/{namespace}/{name}/apply", post(apply_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
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

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(std::sync::atomic::Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Synchronous apply: plan and apply the stack's latest commit in the
/// request's lifetime. Shares the stack handler with the queue-driven
/// pipeline but none of its shard-based exclusivity.
async fn apply_handler(
    State(state): State<Arc<ServerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match sync_apply(&state, &namespace, &name).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            error!("Synchronous apply of {}/{} failed: {:#}", namespace, name, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("{e:#}") })),
            )
                .into_response()
        }
    }
}

async fn sync_apply(
    state: &ServerState,
    namespace: &str,
    name: &str,
) -> anyhow::Result<serde_json::Value> {
    let api: Api<TerraformStack> = Api::namespaced(state.client.clone(), namespace);
    let stack = api.get(name).await?;

    let commit = state
        .repository
        .get_last_commit_id(&stack.spec.repo.repo, &stack.spec.repo.target_revision)
        .await?;

    // Best effort: surface what the previous plan was computed against. The
    // read carries its own short timeout and never holds up the apply.
    let previous_plan_commit = state
        .records
        .load_plan(&stack)
        .await
        .ok()
        .flatten()
        .map(|record| record.commit_id);

    metrics::increment_plans();
    let changed = state.handler.plan(&stack, &commit).await.inspect_err(|_| {
        metrics::increment_plan_errors();
    })?;

    let latest = worker::fetch_latest(&state.client, &stack).await?;
    let history_id = latest.status_or_default().next_history_id();
    let started_at = chrono::Utc::now().to_rfc3339();

    metrics::increment_applies();
    let apply_result = state.handler.apply(&stack, &commit, history_id).await;
    let apply_error = apply_result.as_ref().err().map(|e| format!("{e:#}"));
    if apply_error.is_some() {
        metrics::increment_apply_errors();
    }

    let entry = ApplyHistory {
        id: history_id,
        started_at: Some(started_at),
        finished_at: Some(chrono::Utc::now().to_rfc3339()),
        revision: Some(commit.clone()),
    };
    let latest = worker::fetch_latest(&state.client, &stack).await?;
    let patch = worker::apply_status_patch(
        &latest.status_or_default(),
        &commit,
        entry,
        apply_error.as_deref(),
    );
    worker::merge_status(&state.client, &stack, patch).await?;

    let phase = if apply_error.is_none() {
        OperationPhase::Succeeded
    } else {
        OperationPhase::Error
    };
    let message = apply_error
        .clone()
        .unwrap_or_else(|| format!("applied revision {commit} (history {history_id})"));
    worker::merge_status(
        &state.client,
        &stack,
        worker::operation_status_patch(phase, &message),
    )
    .await?;

    // Surface whether an operator signal was pending; this path does not
    // consume it.
    let pending_signal = SyncCommand::from_stack(&stack) != SyncCommand::None;

    match apply_result {
        Ok(()) => Ok(serde_json::json!({
            "commit": commit,
            "previousPlanCommit": previous_plan_commit,
            "planChanged": changed,
            "historyId": history_id,
            "pendingSignal": pending_signal,
        })),
        Err(e) => Err(e),
    }
}
