//! # Operator Annotations
//!
//! One-shot operator signals carried as annotations on the `TerraformStack`
//! resource. The worker derives a [`SyncCommand`] once per cycle and removes
//! the consumed annotation with an explicit merge patch, so a signal can
//! never fire twice.

use crate::crd::TerraformStack;
use anyhow::{Context, Result};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

/// Requests a one-shot apply; the value is the commit the operator intends
/// to sync to.
pub const SYNC_REQUESTED: &str = "terraform.octopilot.io/sync-requested";
/// Requests a one-shot destroy of the stack's managed resources.
pub const CLEAN_REQUESTED: &str = "terraform.octopilot.io/clean-requested";

/// Field manager name used on all patches issued by this control plane.
pub const FIELD_MANAGER: &str = "terraform-stack-controller";

/// One-shot command derived from the stack's current annotations.
///
/// Clean wins over sync when both are present: a destroy request makes any
/// pending apply request moot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    None,
    /// Apply, but only if the recorded commit is still the latest.
    SyncRequested(String),
    /// Destroy managed resources and skip apply logic for this cycle.
    CleanRequested,
}

impl SyncCommand {
    pub fn from_stack(stack: &TerraformStack) -> Self {
        let annotations = stack.annotations();
        if annotations.contains_key(CLEAN_REQUESTED) {
            return SyncCommand::CleanRequested;
        }
        match annotations.get(SYNC_REQUESTED) {
            Some(commit) => SyncCommand::SyncRequested(commit.clone()),
            None => SyncCommand::None,
        }
    }

    /// Annotation key this command was derived from, if any.
    pub fn annotation_key(&self) -> Option<&'static str> {
        match self {
            SyncCommand::None => None,
            SyncCommand::SyncRequested(_) => Some(SYNC_REQUESTED),
            SyncCommand::CleanRequested => Some(CLEAN_REQUESTED),
        }
    }
}

/// Remove a consumed signal annotation from the stack.
///
/// A merge patch with a null value deletes just that key, leaving other
/// metadata untouched.
pub async fn remove_annotation(client: &Client, stack: &TerraformStack, key: &str) -> Result<()> {
    let name = stack.name_any();
    let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<TerraformStack> = Api::namespaced(client.clone(), &namespace);

    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                key: serde_json::Value::Null
            }
        }
    });

    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await
        .context(format!(
            "Failed to remove annotation {} from TerraformStack {}/{}",
            key, namespace, name
        ))?;

    debug!("Removed annotation {} from TerraformStack {}/{}", key, namespace, name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GitRepoRef, TerraformStackSpec};
    use std::collections::BTreeMap;

    fn stack_with_annotations(annotations: BTreeMap<String, String>) -> TerraformStack {
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
        stack.metadata.annotations = Some(annotations);
        stack
    }

    #[test]
    fn no_annotations_means_no_command() {
        let stack = stack_with_annotations(BTreeMap::new());
        assert_eq!(SyncCommand::from_stack(&stack), SyncCommand::None);
    }

    #[test]
    fn sync_requested_carries_commit() {
        let mut annotations = BTreeMap::new();
        annotations.insert(SYNC_REQUESTED.to_string(), "abc123".to_string());
        let stack = stack_with_annotations(annotations);
        assert_eq!(
            SyncCommand::from_stack(&stack),
            SyncCommand::SyncRequested("abc123".into())
        );
    }

    #[test]
    fn clean_wins_over_sync() {
        let mut annotations = BTreeMap::new();
        annotations.insert(SYNC_REQUESTED.to_string(), "abc123".to_string());
        annotations.insert(CLEAN_REQUESTED.to_string(), "true".to_string());
        let stack = stack_with_annotations(annotations);
        assert_eq!(SyncCommand::from_stack(&stack), SyncCommand::CleanRequested);
    }
}
