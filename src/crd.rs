//! # TerraformStack CRD
//!
//! Custom resource describing one Terraform-managed infrastructure unit:
//! where its configuration lives in git, how it is allowed to be applied,
//! and the audit trail of what has been planned and applied so far.
//!
//! # Example
//!
//! ```yaml
//! apiVersion: terraform.octopilot.io/v1alpha1
//! kind: TerraformStack
//! metadata:
//!   name: payments-network
//!   namespace: infra
//! spec:
//!   project: payments
//!   syncPolicy: auto-sync
//!   destroyResourcesOnDeletion: true
//!   repo:
//!     repo: https://git.example.com/payments/network.git
//!     path: envs/prod
//!     targetRevision: main
//! ```

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// TerraformStack Custom Resource Definition
///
/// The spec declares the desired state (git source + sync policy); the
/// status records what the control plane last planned and applied.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "TerraformStack",
    group = "terraform.octopilot.io",
    version = "v1alpha1",
    namespaced,
    status = "TerraformStackStatus",
    shortname = "tfstack",
    printcolumn = r#"{"name":"Sync", "type":"string", "jsonPath":".status.syncStatus"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.lastAppliedRevision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TerraformStackSpec {
    /// Secret-store project this stack belongs to. Secret tokens embedded in
    /// the Terraform configuration may only reference this project.
    pub project: String,
    /// How applies are triggered: `manual` (explicit request only) or
    /// `auto-sync` (apply whenever out of sync).
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    /// Run a destroy for the managed resources when the stack is deleted.
    #[serde(default)]
    pub destroy_resources_on_deletion: bool,
    /// Git source of the Terraform configuration.
    pub repo: GitRepoRef,
    /// Optional terraform `-target` resource addresses to scope plan/apply.
    #[serde(default)]
    pub apply_targets: Option<Vec<String>>,
    /// Extra `-backend-config` key=value pairs passed at init time, on top of
    /// the controller-injected backend wiring.
    #[serde(default)]
    pub backend_config: Option<BTreeMap<String, String>>,
}

/// Git repository reference for a stack's Terraform configuration.
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoRef {
    /// Clone URL (https or ssh).
    pub repo: String,
    /// Path inside the repository holding the stack's configuration files.
    /// Empty or "." means the repository root.
    #[serde(default)]
    pub path: String,
    /// Branch or tag name resolved to a commit on every reconciliation.
    pub target_revision: String,
}

impl GitRepoRef {
    /// Directory within a checkout that holds this stack's configuration.
    pub fn config_path(&self) -> &str {
        let trimmed = self.path.trim_matches('/');
        if trimmed.is_empty() || trimmed == "." {
            ""
        } else {
            trimmed
        }
    }
}

/// Sync policy for a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, schemars::JsonSchema)]
pub enum SyncPolicy {
    /// Apply only when an operator explicitly requests it.
    #[default]
    #[serde(rename = "manual")]
    Manual,
    /// Apply automatically whenever the stack is out of sync.
    #[serde(rename = "auto-sync")]
    AutoSync,
}

/// Whether the live state is known to match the tracked revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum SyncStatus {
    OutOfSync,
    Synced,
}

/// Outcome phase of the most recent reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum OperationPhase {
    Succeeded,
    Error,
}

/// Final outcome of the most recent cycle: phase, human-readable message,
/// and when the cycle finished.
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub phase: OperationPhase,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
}

/// One apply attempt in the stack's history.
///
/// Ids increase monotonically and are never reused; each id keys exactly one
/// persisted apply result record.
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyHistory {
    pub id: u64,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

/// Status of the TerraformStack resource.
#[derive(Debug, Clone, Deserialize, Serialize, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerraformStackStatus {
    /// Commit last applied successfully.
    #[serde(default)]
    pub last_applied_revision: Option<String>,
    /// Commit last planned against.
    #[serde(default)]
    pub last_planned_revision: Option<String>,
    #[serde(default)]
    pub last_plan_at: Option<String>,
    #[serde(default)]
    pub last_applied_at: Option<String>,
    #[serde(default)]
    pub sync_status: Option<SyncStatus>,
    #[serde(default)]
    pub operation_status: Option<OperationStatus>,
    /// Apply history, newest last.
    #[serde(default)]
    pub history: Vec<ApplyHistory>,
    #[serde(default)]
    pub last_plan_error: Option<String>,
    #[serde(default)]
    pub last_apply_error: Option<String>,
}

impl TerraformStackStatus {
    /// Next apply-history id. Ids only ever increase, even if operators prune
    /// old entries, so the maximum existing id is the floor.
    pub fn next_history_id(&self) -> u64 {
        self.history.iter().map(|h| h.id).max().unwrap_or(0) + 1
    }

    /// Commit last applied, or `None` when the stack has never been applied.
    pub fn applied_revision(&self) -> Option<&str> {
        self.last_applied_revision.as_deref().filter(|r| !r.is_empty())
    }
}

impl TerraformStack {
    /// Status, defaulted when the resource has never been reconciled.
    pub fn status_or_default(&self) -> TerraformStackStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_policy_wire_names() {
        assert_eq!(serde_json::to_string(&SyncPolicy::Manual).unwrap(), "\"manual\"");
        assert_eq!(serde_json::to_string(&SyncPolicy::AutoSync).unwrap(), "\"auto-sync\"");
        let parsed: SyncPolicy = serde_json::from_str("\"auto-sync\"").unwrap();
        assert_eq!(parsed, SyncPolicy::AutoSync);
    }

    #[test]
    fn next_history_id_starts_at_one() {
        let status = TerraformStackStatus::default();
        assert_eq!(status.next_history_id(), 1);
    }

    #[test]
    fn next_history_id_increments_past_max() {
        let status = TerraformStackStatus {
            history: vec![
                ApplyHistory { id: 1, started_at: None, finished_at: None, revision: None },
                ApplyHistory { id: 7, started_at: None, finished_at: None, revision: None },
                ApplyHistory { id: 3, started_at: None, finished_at: None, revision: None },
            ],
            ..Default::default()
        };
        assert_eq!(status.next_history_id(), 8);
    }

    #[test]
    fn applied_revision_treats_empty_as_never_applied() {
        let mut status = TerraformStackStatus::default();
        assert!(status.applied_revision().is_none());
        status.last_applied_revision = Some(String::new());
        assert!(status.applied_revision().is_none());
        status.last_applied_revision = Some("abc123".into());
        assert_eq!(status.applied_revision(), Some("abc123"));
    }

    #[test]
    fn config_path_normalizes_root_spellings() {
        let mut repo = GitRepoRef {
            repo: "https://git.example.com/org/repo.git".into(),
            path: String::new(),
            target_revision: "main".into(),
        };
        assert_eq!(repo.config_path(), "");
        repo.path = ".".into();
        assert_eq!(repo.config_path(), "");
        repo.path = "/envs/prod/".into();
        assert_eq!(repo.config_path(), "envs/prod");
    }
}
