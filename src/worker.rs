//! # Worker
//!
//! Long-running executor bound to one queue shard. Pulls stacks, resolves
//! the latest source commit, always plans, conditionally applies or destroys
//! based on sync policy and operator annotations, and merges status updates
//! back without clobbering concurrent writers.
//!
//! Each status write re-fetches the latest stored stack and merge-patches
//! only the sub-fields it owns: the control loop and the worker can race on
//! the same resource.
//!
//! Per-stack handling is bounded by an overall timeout. On timeout the
//! handling future is abandoned but an in-flight terraform process is not
//! killed; it runs to completion in the background.

use crate::annotations::{remove_annotation, SyncCommand, FIELD_MANAGER};
use crate::config;
use crate::crd::{
    ApplyHistory, OperationPhase, SyncPolicy, SyncStatus, TerraformStack, TerraformStackStatus,
};
use crate::handler::StackHandler;
use crate::queue::client::QueueClient;
use crate::repository::Repository;
use crate::metrics;
use anyhow::{Context, Result};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Shard index from an ordinal pod hostname (`stack-worker-3` -> 3).
pub fn ordinal_from_hostname(hostname: &str) -> Option<usize> {
    hostname.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

/// OutOfSync when the resolved commit differs from the last applied one or
/// the plan detected live-state drift.
pub(crate) fn compute_sync_status(
    resolved_commit: &str,
    last_applied: Option<&str>,
    plan_changed: bool,
) -> SyncStatus {
    if last_applied != Some(resolved_commit) || plan_changed {
        SyncStatus::OutOfSync
    } else {
        SyncStatus::Synced
    }
}

/// Apply decision for one cycle. A `sync-requested` annotation asks for an
/// apply only when its recorded commit matches the freshly resolved one and
/// the stack is not already synced; `auto-sync` asks whenever out of sync.
pub(crate) fn should_apply(
    command: &SyncCommand,
    policy: SyncPolicy,
    resolved_commit: &str,
    sync_status: SyncStatus,
) -> bool {
    let requested = matches!(
        command,
        SyncCommand::SyncRequested(commit)
            if commit == resolved_commit && sync_status != SyncStatus::Synced
    );
    let auto = policy == SyncPolicy::AutoSync && sync_status == SyncStatus::OutOfSync;
    requested || auto
}

/// Merge patch for the plan-owned status fields. `commit` is set only when
/// the plan actually ran against it.
pub(crate) fn plan_status_patch(
    commit: Option<&str>,
    plan_error: Option<&str>,
    sync_status: SyncStatus,
) -> serde_json::Value {
    let mut status = serde_json::json!({
        "lastPlanAt": now_rfc3339(),
        "lastPlanError": plan_error,
        "syncStatus": sync_status,
    });
    if let Some(commit) = commit {
        status["lastPlannedRevision"] = serde_json::Value::String(commit.to_string());
    }
    serde_json::json!({ "status": status })
}

/// Merge patch for the apply-owned status fields, appending the history
/// entry onto the latest stored history.
pub(crate) fn apply_status_patch(
    latest: &TerraformStackStatus,
    commit: &str,
    entry: ApplyHistory,
    apply_error: Option<&str>,
) -> serde_json::Value {
    let mut history = latest.history.clone();
    history.push(entry);

    let mut status = serde_json::json!({
        "lastAppliedAt": now_rfc3339(),
        "lastApplyError": apply_error,
        "history": history,
    });
    if apply_error.is_none() {
        status["lastAppliedRevision"] = serde_json::Value::String(commit.to_string());
        status["syncStatus"] = serde_json::json!(SyncStatus::Synced);
    }
    serde_json::json!({ "status": status })
}

pub(crate) fn operation_status_patch(phase: OperationPhase, message: &str) -> serde_json::Value {
    serde_json::json!({
        "status": {
            "operationStatus": {
                "phase": phase,
                "message": message,
                "finishedAt": now_rfc3339(),
            }
        }
    })
}

pub(crate) async fn fetch_latest(client: &Client, stack: &TerraformStack) -> Result<TerraformStack> {
    let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<TerraformStack> = Api::namespaced(client.clone(), &namespace);
    api.get(&stack.name_any())
        .await
        .context(format!("Failed to fetch latest TerraformStack {}", stack.name_any()))
}

/// Merge-patch the status subresource. Re-fetches the latest stored version
/// first and patches that, so only the sub-fields in `patch` are touched and
/// concurrent writers keep their fields.
pub(crate) async fn merge_status(
    client: &Client,
    stack: &TerraformStack,
    patch: serde_json::Value,
) -> Result<()> {
    let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<TerraformStack> = Api::namespaced(client.clone(), &namespace);
    let latest = fetch_latest(client, stack).await?;
    api.patch_status(
        &latest.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(patch),
    )
    .await
    .context(format!("Failed to patch status of TerraformStack {}", stack.name_any()))?;
    Ok(())
}

pub struct Worker {
    client: Client,
    queue: QueueClient,
    queue_url: String,
    handler: Arc<dyn StackHandler>,
    repository: Arc<dyn Repository>,
    shard: usize,
    poll_interval: Duration,
    handle_timeout: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("shard", &self.shard).finish()
    }
}

impl Worker {
    pub fn new(
        client: Client,
        queue_url: &str,
        handler: Arc<dyn StackHandler>,
        repository: Arc<dyn Repository>,
        shard: usize,
        poll_interval: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client,
            queue: QueueClient::new(queue_url)?,
            queue_url: queue_url.to_string(),
            handler,
            repository,
            shard,
            poll_interval,
            handle_timeout: config::worker_handle_timeout(),
        })
    }

    /// Poll loop. A single stack's failure never stops the loop; the queue
    /// connection is rebuilt whenever the server stops answering readiness.
    pub async fn run(&mut self) -> Result<()> {
        info!("Worker starting on shard {}", self.shard);
        loop {
            if !self.queue.ready().await {
                warn!("Work queue not ready; reconnecting");
                tokio::time::sleep(self.poll_interval).await;
                self.queue = QueueClient::new(&self.queue_url)?;
                continue;
            }

            match self.queue.poll(self.shard).await {
                Ok(Some(stack)) => {
                    let key = format!(
                        "{}/{}",
                        stack.namespace().unwrap_or_default(),
                        stack.name_any()
                    );
                    match tokio::time::timeout(self.handle_timeout, self.handle(stack)).await {
                        Ok(Ok(())) => debug!("Finished cycle for {}", key),
                        Ok(Err(e)) => error!("Cycle for {} failed: {:#}", key, e),
                        Err(_) => warn!(
                            "Cycle for {} exceeded {}s; abandoning it (an in-flight terraform \
                             process keeps running until it exits)",
                            key,
                            self.handle_timeout.as_secs()
                        ),
                    }
                }
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    error!("Poll on shard {} failed: {:#}", self.shard, e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// One reconciliation cycle for one stack.
    pub async fn handle(&self, stack: TerraformStack) -> Result<()> {
        let start = Instant::now();
        let name = stack.name_any();
        let status = stack.status_or_default();

        // Step 1: resolve the latest commit for the configured revision.
        let mut resolve_error: Option<String> = None;
        let commit = match self
            .repository
            .get_last_commit_id(&stack.spec.repo.repo, &stack.spec.repo.target_revision)
            .await
        {
            Ok(commit) => Some(commit),
            Err(e) => {
                warn!("Failed to resolve revision for {}: {:#}", name, e);
                resolve_error = Some(format!("{e:#}"));
                None
            }
        };

        // Step 2: always plan; a plan failure is recorded, not fatal to the
        // loop.
        let mut plan_error: Option<String> = None;
        let mut plan_changed = false;
        let mut sync_status: Option<SyncStatus> = None;
        if let Some(commit) = &commit {
            metrics::increment_plans();
            match self.handler.plan(&stack, commit).await {
                Ok(changed) => plan_changed = changed,
                Err(e) => {
                    metrics::increment_plan_errors();
                    plan_error = Some(format!("{e:#}"));
                }
            }
            let computed =
                compute_sync_status(commit, status.applied_revision(), plan_changed);
            sync_status = Some(computed);

            let planned_commit = plan_error.is_none().then_some(commit.as_str());
            let patch = plan_status_patch(planned_commit, plan_error.as_deref(), computed);
            merge_status(&self.client, &stack, patch).await?;
        }

        // Step 3: derive the one-shot command and consume its annotation
        // before acting on it.
        let command = SyncCommand::from_stack(&stack);
        if let Some(key) = command.annotation_key() {
            if let Err(e) = remove_annotation(&self.client, &stack, key).await {
                warn!("Failed to remove {} annotation from {}: {:#}", key, name, e);
            }
        }

        if command == SyncCommand::CleanRequested {
            let destroy_error = match self.handler.destroy(&stack).await {
                Ok(()) => {
                    metrics::increment_destroys();
                    None
                }
                Err(e) => Some(format!("{e:#}")),
            };
            let message = destroy_error
                .clone()
                .unwrap_or_else(|| "destroyed managed resources".to_string());
            let phase = if destroy_error.is_none() {
                OperationPhase::Succeeded
            } else {
                OperationPhase::Error
            };
            merge_status(&self.client, &stack, operation_status_patch(phase, &message)).await?;
            metrics::observe_cycle_duration(start.elapsed().as_secs_f64());
            return Ok(());
        }

        // Steps 4-5: decide and run the apply.
        let mut apply_error: Option<String> = None;
        let mut applied_history: Option<u64> = None;
        if let (Some(commit), Some(current)) = (&commit, sync_status) {
            if plan_error.is_none()
                && should_apply(&command, stack.spec.sync_policy, commit, current)
            {
                let latest = fetch_latest(&self.client, &stack).await?;
                let history_id = latest.status_or_default().next_history_id();
                let started_at = now_rfc3339();

                metrics::increment_applies();
                let result = self.handler.apply(&stack, commit, history_id).await;
                if let Err(e) = &result {
                    metrics::increment_apply_errors();
                    apply_error = Some(format!("{e:#}"));
                } else {
                    applied_history = Some(history_id);
                }

                let entry = ApplyHistory {
                    id: history_id,
                    started_at: Some(started_at),
                    finished_at: Some(now_rfc3339()),
                    revision: Some(commit.clone()),
                };
                let latest = fetch_latest(&self.client, &stack).await?;
                let patch = apply_status_patch(
                    &latest.status_or_default(),
                    commit,
                    entry,
                    apply_error.as_deref(),
                );
                merge_status(&self.client, &stack, patch).await?;
            }
        }

        // Step 6: final operation status for the cycle.
        let errors: Vec<String> = [resolve_error, plan_error, apply_error]
            .into_iter()
            .flatten()
            .collect();
        let (phase, message) = if errors.is_empty() {
            let message = match (applied_history, &commit) {
                (Some(id), Some(commit)) => format!("applied revision {commit} (history {id})"),
                (None, Some(commit)) => format!("planned revision {commit}"),
                _ => "reconciled".to_string(),
            };
            (OperationPhase::Succeeded, message)
        } else {
            (OperationPhase::Error, errors.join("; "))
        };
        merge_status(&self.client, &stack, operation_status_patch(phase, &message)).await?;

        metrics::observe_cycle_duration(start.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod sync_status_tests {
        use super::*;

        #[test]
        fn unchanged_commit_and_clean_plan_is_synced() {
            assert_eq!(
                compute_sync_status("abc", Some("abc"), false),
                SyncStatus::Synced
            );
        }

        #[test]
        fn new_commit_is_out_of_sync() {
            assert_eq!(
                compute_sync_status("def", Some("abc"), false),
                SyncStatus::OutOfSync
            );
        }

        #[test]
        fn live_drift_is_out_of_sync_even_on_same_commit() {
            assert_eq!(
                compute_sync_status("abc", Some("abc"), true),
                SyncStatus::OutOfSync
            );
        }

        #[test]
        fn never_applied_is_out_of_sync() {
            assert_eq!(compute_sync_status("abc", None, false), SyncStatus::OutOfSync);
        }
    }

    mod apply_decision_tests {
        use super::*;

        #[test]
        fn manual_policy_without_request_never_applies() {
            assert!(!should_apply(
                &SyncCommand::None,
                SyncPolicy::Manual,
                "abc",
                SyncStatus::Synced
            ));
            assert!(!should_apply(
                &SyncCommand::None,
                SyncPolicy::Manual,
                "abc",
                SyncStatus::OutOfSync
            ));
        }

        #[test]
        fn auto_sync_applies_when_out_of_sync() {
            assert!(should_apply(
                &SyncCommand::None,
                SyncPolicy::AutoSync,
                "abc",
                SyncStatus::OutOfSync
            ));
            assert!(!should_apply(
                &SyncCommand::None,
                SyncPolicy::AutoSync,
                "abc",
                SyncStatus::Synced
            ));
        }

        #[test]
        fn sync_request_with_matching_commit_applies() {
            assert!(should_apply(
                &SyncCommand::SyncRequested("abc".into()),
                SyncPolicy::Manual,
                "abc",
                SyncStatus::OutOfSync
            ));
        }

        #[test]
        fn sync_request_with_stale_commit_is_skipped() {
            assert!(!should_apply(
                &SyncCommand::SyncRequested("old".into()),
                SyncPolicy::Manual,
                "new",
                SyncStatus::OutOfSync
            ));
        }

        #[test]
        fn sync_request_on_synced_stack_is_skipped() {
            assert!(!should_apply(
                &SyncCommand::SyncRequested("abc".into()),
                SyncPolicy::Manual,
                "abc",
                SyncStatus::Synced
            ));
        }
    }

    mod patch_tests {
        use super::*;

        #[test]
        fn plan_patch_clears_error_on_success() {
            let patch = plan_status_patch(Some("abc"), None, SyncStatus::Synced);
            assert_eq!(patch["status"]["lastPlannedRevision"], "abc");
            assert!(patch["status"]["lastPlanError"].is_null());
            assert_eq!(patch["status"]["syncStatus"], "Synced");
        }

        #[test]
        fn plan_patch_keeps_revision_untouched_on_error() {
            let patch = plan_status_patch(None, Some("boom"), SyncStatus::OutOfSync);
            assert!(patch["status"].get("lastPlannedRevision").is_none());
            assert_eq!(patch["status"]["lastPlanError"], "boom");
        }

        #[test]
        fn apply_patch_appends_history_and_syncs_on_success() {
            let latest = TerraformStackStatus {
                history: vec![ApplyHistory {
                    id: 4,
                    started_at: None,
                    finished_at: None,
                    revision: Some("old".into()),
                }],
                ..Default::default()
            };
            let entry = ApplyHistory {
                id: 5,
                started_at: Some(now_rfc3339()),
                finished_at: Some(now_rfc3339()),
                revision: Some("abc".into()),
            };
            let patch = apply_status_patch(&latest, "abc", entry, None);
            assert_eq!(patch["status"]["history"].as_array().unwrap().len(), 2);
            assert_eq!(patch["status"]["history"][1]["id"], 5);
            assert_eq!(patch["status"]["lastAppliedRevision"], "abc");
            assert_eq!(patch["status"]["syncStatus"], "Synced");
        }

        #[test]
        fn apply_patch_on_failure_records_error_without_revision() {
            let latest = TerraformStackStatus::default();
            let entry = ApplyHistory {
                id: 1,
                started_at: None,
                finished_at: None,
                revision: Some("abc".into()),
            };
            let patch = apply_status_patch(&latest, "abc", entry, Some("apply exploded"));
            assert_eq!(patch["status"]["lastApplyError"], "apply exploded");
            assert!(patch["status"].get("lastAppliedRevision").is_none());
            assert!(patch["status"].get("syncStatus").is_none());
            // The history id was consumed either way.
            assert_eq!(patch["status"]["history"][0]["id"], 1);
        }
    }

    #[test]
    fn hostname_ordinal_parses_statefulset_names() {
        assert_eq!(ordinal_from_hostname("stack-worker-3"), Some(3));
        assert_eq!(ordinal_from_hostname("worker-12"), Some(12));
        assert_eq!(ordinal_from_hostname("worker"), None);
        assert_eq!(ordinal_from_hostname("worker-x"), None);
    }
}
