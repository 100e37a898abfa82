//! # Reconciler
//!
//! Control loop for `TerraformStack` resources. On every watch notification:
//! if deletion is requested, optionally destroy the managed resources and
//! drop the finalizer; otherwise ensure the finalizer, push the stack onto
//! the work queue, and requeue after the fixed reconcile interval so drift
//! is detected even with no external event.
//!
//! A trigger cache filters reconciliation storms: when the worker consumes a
//! `sync-requested` / `clean-requested` annotation it removes it, and that
//! removal fires a watch event. A wake-up whose only difference from the
//! cached view is such a removal skips the queue push and just waits out the
//! rest of the interval. Spec, label, or any other annotation change always
//! pushes.

use crate::annotations::{CLEAN_REQUESTED, FIELD_MANAGER, SYNC_REQUESTED};
use crate::config;
use crate::crd::TerraformStack;
use crate::handler::StackHandler;
use crate::metrics;
use crate::queue::client::QueueClient;
use anyhow::{Context, Result};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::Action;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const FINALIZER: &str = "terraform.octopilot.io/finalizer";

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

/// Cached view of the last trigger that actually pushed a stack.
#[derive(Debug, Clone)]
pub(crate) struct TriggerState {
    generation: Option<i64>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    last_push: Instant,
}

impl TriggerState {
    fn capture(stack: &TerraformStack) -> Self {
        Self {
            generation: stack.metadata.generation,
            labels: stack.labels().clone(),
            annotations: stack.annotations().clone(),
            last_push: Instant::now(),
        }
    }
}

/// True when the only difference between the cached trigger and the current
/// resource is that transient signal annotations disappeared. Such wake-ups
/// are self-inflicted (the worker consumed the signal) and must not push.
pub(crate) fn is_noise_event(prev: &TriggerState, stack: &TerraformStack) -> bool {
    if prev.generation != stack.metadata.generation {
        return false;
    }
    if prev.labels != *stack.labels() {
        return false;
    }
    let current = stack.annotations();
    // Anything added or changed is a real trigger.
    for (key, value) in current {
        if prev.annotations.get(key) != Some(value) {
            return false;
        }
    }
    // Removals are noise only for the transient signal keys.
    for key in prev.annotations.keys() {
        if !current.contains_key(key) && key != SYNC_REQUESTED && key != CLEAN_REQUESTED {
            return false;
        }
    }
    true
}

pub struct Reconciler {
    pub client: Client,
    queue: QueueClient,
    handler: Arc<dyn StackHandler>,
    interval: Duration,
    triggers: Mutex<HashMap<String, TriggerState>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("interval", &self.interval)
            .finish()
    }
}

impl Reconciler {
    pub fn new(client: Client, queue: QueueClient, handler: Arc<dyn StackHandler>) -> Self {
        Self {
            client,
            queue,
            handler,
            interval: config::reconcile_interval(),
            triggers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn reconcile(
        stack: Arc<TerraformStack>,
        ctx: Arc<Reconciler>,
    ) -> Result<Action, ReconcilerError> {
        let name = stack.name_any();
        let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
        let key = format!("{namespace}/{name}");
        metrics::increment_reconciliations();

        if stack.metadata.deletion_timestamp.is_some() {
            return ctx.finalize_deletion(&stack, &namespace, &name).await;
        }

        ctx.ensure_finalizer(&stack, &namespace, &name).await?;

        // Noise filter: suppressed wake-ups wait out the rest of the
        // interval instead of pushing.
        let suppressed_for = {
            let triggers = ctx
                .triggers
                .lock()
                .map_err(|_| anyhow::anyhow!("trigger cache lock poisoned"))?;
            triggers.get(&key).and_then(|prev| {
                if is_noise_event(prev, &stack) {
                    ctx.interval.checked_sub(prev.last_push.elapsed())
                } else {
                    None
                }
            })
        };
        if let Some(remaining) = suppressed_for {
            debug!(
                "Suppressing reconciliation of {} (signal annotation removal); next push in {}s",
                key,
                remaining.as_secs()
            );
            return Ok(Action::requeue(remaining));
        }

        ctx.queue
            .push(&stack)
            .await
            .context(format!("Failed to enqueue stack {key}"))?;
        info!("Enqueued TerraformStack {} for execution", key);

        {
            let mut triggers = ctx
                .triggers
                .lock()
                .map_err(|_| anyhow::anyhow!("trigger cache lock poisoned"))?;
            triggers.insert(key, TriggerState::capture(&stack));
        }

        Ok(Action::requeue(ctx.interval))
    }

    pub fn error_policy(
        stack: Arc<TerraformStack>,
        error: &ReconcilerError,
        _ctx: Arc<Reconciler>,
    ) -> Action {
        error!(
            "Reconciliation error for {}: {:?}",
            stack.name_any(),
            error
        );
        metrics::increment_reconciliation_errors();
        Action::requeue(Duration::from_secs(60))
    }

    /// Deletion path: run destroy-on-deletion when configured, then release
    /// the finalizer so the resource can be garbage-collected.
    async fn finalize_deletion(
        &self,
        stack: &TerraformStack,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ReconcilerError> {
        if !stack.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(Action::await_change());
        }

        if stack.spec.destroy_resources_on_deletion {
            info!("Destroying resources of TerraformStack {}/{} before deletion", namespace, name);
            self.handler
                .destroy(stack)
                .await
                .context(format!("Failed to destroy resources of {namespace}/{name}"))?;
            metrics::increment_destroys();
        }

        let remaining: Vec<String> = stack
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(namespace, name, remaining).await?;

        {
            let mut triggers = self
                .triggers
                .lock()
                .map_err(|_| anyhow::anyhow!("trigger cache lock poisoned"))?;
            triggers.remove(&format!("{namespace}/{name}"));
        }

        info!("Released finalizer on TerraformStack {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    async fn ensure_finalizer(
        &self,
        stack: &TerraformStack,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        if stack.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let mut finalizers: Vec<String> = stack.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(namespace, name, finalizers).await?;
        debug!("Attached finalizer to TerraformStack {}/{}", namespace, name);
        Ok(())
    }

    /// Partial merge patch touching only `metadata.finalizers`, so concurrent
    /// writers of other metadata are not clobbered.
    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let api: Api<TerraformStack> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .context(format!(
                "Failed to patch finalizers of TerraformStack {namespace}/{name}"
            ))?;
        Ok(())
    }
}

/// Queue pushes survive transient queue outages via the error policy; warn
/// loudly when the queue stays unreachable so operators see the gap.
pub async fn warn_if_queue_unreachable(queue: &QueueClient) {
    if !queue.ready().await {
        warn!("Work queue is not ready; stacks will be retried by the error policy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GitRepoRef, TerraformStackSpec};

    fn stack(
        generation: Option<i64>,
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
    ) -> TerraformStack {
        let mut stack = TerraformStack::new(
            "demo",
            TerraformStackSpec {
                project: "demo".into(),
                sync_policy: Default::default(),
                destroy_resources_on_deletion: false,
                repo: GitRepoRef {
                    repo: "https://git.example.com/demo.git".into(),
                    path: String::new(),
                    target_revision: "main".into(),
                },
                apply_targets: None,
                backend_config: None,
            },
        );
        stack.metadata.generation = generation;
        stack.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
        stack.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
        stack
    }

    fn state_of(stack: &TerraformStack) -> TriggerState {
        TriggerState::capture(stack)
    }

    #[test]
    fn removal_of_sync_annotation_is_noise() {
        let before = stack(Some(1), &[], &[(SYNC_REQUESTED, "abc123")]);
        let after = stack(Some(1), &[], &[]);
        assert!(is_noise_event(&state_of(&before), &after));
    }

    #[test]
    fn removal_of_clean_annotation_is_noise() {
        let before = stack(Some(1), &[], &[(CLEAN_REQUESTED, "true"), ("team", "payments")]);
        let after = stack(Some(1), &[], &[("team", "payments")]);
        assert!(is_noise_event(&state_of(&before), &after));
    }

    #[test]
    fn adding_sync_annotation_is_a_real_trigger() {
        let before = stack(Some(1), &[], &[]);
        let after = stack(Some(1), &[], &[(SYNC_REQUESTED, "abc123")]);
        assert!(!is_noise_event(&state_of(&before), &after));
    }

    #[test]
    fn spec_change_is_a_real_trigger() {
        let before = stack(Some(1), &[], &[]);
        let after = stack(Some(2), &[], &[]);
        assert!(!is_noise_event(&state_of(&before), &after));
    }

    #[test]
    fn label_change_is_a_real_trigger() {
        let before = stack(Some(1), &[("env", "dev")], &[]);
        let after = stack(Some(1), &[("env", "prod")], &[]);
        assert!(!is_noise_event(&state_of(&before), &after));
    }

    #[test]
    fn removing_a_regular_annotation_is_a_real_trigger() {
        let before = stack(Some(1), &[], &[("team", "payments")]);
        let after = stack(Some(1), &[], &[]);
        assert!(!is_noise_event(&state_of(&before), &after));
    }

    #[test]
    fn changing_an_annotation_value_is_a_real_trigger() {
        let before = stack(Some(1), &[], &[("team", "payments")]);
        let after = stack(Some(1), &[], &[("team", "billing")]);
        assert!(!is_noise_event(&state_of(&before), &after));
    }

    #[test]
    fn identical_resource_is_noise() {
        let before = stack(Some(3), &[("env", "dev")], &[("team", "payments")]);
        let after = before.clone();
        assert!(is_noise_event(&state_of(&before), &after));
    }
}
