//! # Result Records
//!
//! Every plan that shows a difference and every apply attempt leaves a
//! persisted result record for audit and diffing. Records are Kubernetes
//! Secrets owned by their stack: one live plan record per stack (overwritten
//! on each plan), one apply record per history id (never overwritten).
//!
//! Payloads are stored gzip-compressed under the `result` data key; the
//! source commit rides along as an annotation.

use crate::crd::TerraformStack;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Kubernetes object-name limit; longer record names are truncated.
pub const MAX_RECORD_NAME: usize = 253;

pub const COMMIT_ANNOTATION: &str = "terraform.octopilot.io/commit-id";
pub const HISTORY_ANNOTATION: &str = "terraform.octopilot.io/history-id";
pub const STACK_LABEL: &str = "terraform.octopilot.io/stack";
pub const STACK_UID_LABEL: &str = "terraform.octopilot.io/stack-uid";

/// Reads of prior records are secondary calls and never hold up a cycle.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Which record is being persisted. Plan records are a singleton per stack;
/// apply records are keyed by their history id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Plan,
    Apply { history_id: u64 },
}

impl RecordKind {
    /// Deterministic record name for a stack, truncated to the storage limit.
    pub fn record_name(&self, stack_name: &str) -> String {
        let raw = match self {
            RecordKind::Plan => format!("tfplan-{stack_name}"),
            RecordKind::Apply { history_id } => format!("tfapply-{stack_name}-{history_id}"),
        };
        truncate_name(&raw)
    }
}

/// Truncate a record name to [`MAX_RECORD_NAME`], appending a short content
/// hash of the untruncated name so distinct long names cannot collide.
pub fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_RECORD_NAME {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    let suffix = format!("{digest:x}");
    let keep = MAX_RECORD_NAME - 9;
    format!("{}-{}", &name[..keep], &suffix[..8])
}

pub fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload).context("Failed to compress result payload")?;
    encoder.finish().context("Failed to finish compressing result payload")
}

pub fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("Failed to decompress result payload")?;
    Ok(out)
}

/// A persisted record read back from storage, payload already decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub name: String,
    pub commit_id: String,
    pub payload: String,
    pub history_id: Option<u64>,
}

/// Storage seam for result records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist one result. Plan records replace any previous plan record for
    /// the stack; apply records are created once per history id.
    async fn persist(
        &self,
        stack: &TerraformStack,
        kind: RecordKind,
        commit_id: &str,
        payload: &str,
    ) -> Result<()>;

    /// Read the live plan record for a stack, if any.
    async fn load_plan(&self, stack: &TerraformStack) -> Result<Option<ResultRecord>>;
}

/// Kubernetes-backed record store.
#[derive(Clone)]
pub struct K8sRecordStore {
    client: Client,
}

impl std::fmt::Debug for K8sRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sRecordStore").finish()
    }
}

impl K8sRecordStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, stack: &TerraformStack) -> Api<Secret> {
        let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }
}

/// Build the Secret object for a record. The stack owns the record, so
/// deleting the stack garbage-collects its audit trail.
pub(crate) fn build_record(
    stack: &TerraformStack,
    kind: RecordKind,
    commit_id: &str,
    payload: &str,
) -> Result<Secret> {
    let name = kind.record_name(&stack.name_any());
    let mut annotations = BTreeMap::new();
    annotations.insert(COMMIT_ANNOTATION.to_string(), commit_id.to_string());
    if let RecordKind::Apply { history_id } = kind {
        annotations.insert(HISTORY_ANNOTATION.to_string(), history_id.to_string());
    }

    let mut labels = BTreeMap::new();
    labels.insert(STACK_LABEL.to_string(), stack.name_any());
    if let Some(uid) = stack.uid() {
        labels.insert(STACK_UID_LABEL.to_string(), uid);
    }

    let owner = stack.controller_owner_ref(&()).map(|mut o| {
        // Records must not block stack deletion.
        o.block_owner_deletion = Some(false);
        o
    });

    let mut data = BTreeMap::new();
    data.insert(
        "result".to_string(),
        k8s_openapi::ByteString(compress(payload.as_bytes())?),
    );

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: stack.namespace(),
            annotations: Some(annotations),
            labels: Some(labels),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

#[async_trait]
impl RecordStore for K8sRecordStore {
    async fn persist(
        &self,
        stack: &TerraformStack,
        kind: RecordKind,
        commit_id: &str,
        payload: &str,
    ) -> Result<()> {
        let api = self.api_for(stack);
        let record = build_record(stack, kind, commit_id, payload)?;
        let name = record.metadata.name.clone().unwrap_or_default();

        match api.create(&PostParams::default(), &record).await {
            Ok(_) => {
                debug!("Created result record {}", name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Last writer wins for the singleton plan record.
                let existing = api
                    .get(&name)
                    .await
                    .context(format!("Failed to fetch existing record {name}"))?;
                let mut replacement = record;
                replacement.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &PostParams::default(), &replacement)
                    .await
                    .context(format!("Failed to replace record {name}"))?;
                debug!("Replaced result record {}", name);
                Ok(())
            }
            Err(e) => Err(e).context(format!("Failed to persist record {name}")),
        }
    }

    async fn load_plan(&self, stack: &TerraformStack) -> Result<Option<ResultRecord>> {
        let api = self.api_for(stack);
        let name = RecordKind::Plan.record_name(&stack.name_any());

        let fetched = tokio::time::timeout(READ_TIMEOUT, api.get_opt(&name))
            .await
            .context(format!("Timed out reading plan record {name}"))?
            .context(format!("Failed to read plan record {name}"))?;

        let Some(secret) = fetched else {
            return Ok(None);
        };

        let payload = secret
            .data
            .as_ref()
            .and_then(|d| d.get("result"))
            .map(|b| decompress(&b.0))
            .transpose()?
            .unwrap_or_default();

        let annotations = secret.metadata.annotations.unwrap_or_default();
        Ok(Some(ResultRecord {
            name,
            commit_id: annotations.get(COMMIT_ANNOTATION).cloned().unwrap_or_default(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            history_id: annotations
                .get(HISTORY_ANNOTATION)
                .and_then(|v| v.parse().ok()),
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names_follow_convention() {
        assert_eq!(RecordKind::Plan.record_name("payments"), "tfplan-payments");
        assert_eq!(
            RecordKind::Apply { history_id: 12 }.record_name("payments"),
            "tfapply-payments-12"
        );
    }

    #[test]
    fn short_names_are_untouched() {
        assert_eq!(truncate_name("tfplan-demo"), "tfplan-demo");
    }

    #[test]
    fn long_names_truncate_with_hash_suffix() {
        let long = format!("tfapply-{}-3", "x".repeat(300));
        let truncated = truncate_name(&long);
        assert_eq!(truncated.len(), MAX_RECORD_NAME);
        assert!(truncated.starts_with("tfapply-xxx"));
        // Deterministic: same input, same name.
        assert_eq!(truncate_name(&long), truncated);
    }

    #[test]
    fn long_names_sharing_a_prefix_do_not_collide() {
        let a = format!("tfapply-{}-1", "x".repeat(300));
        let b = format!("tfapply-{}-2", "x".repeat(300));
        assert_eq!(&a[..MAX_RECORD_NAME - 9], &b[..MAX_RECORD_NAME - 9]);
        assert_ne!(truncate_name(&a), truncate_name(&b));
    }

    #[test]
    fn compress_round_trips_byte_identical() {
        let payload = "Plan: 3 to add, 1 to change, 0 to destroy.\n".repeat(50);
        let compressed = compress(payload.as_bytes()).unwrap();
        assert!(compressed.len() < payload.len());
        // gzip magic bytes.
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        let restored = decompress(&compressed).unwrap();
        assert_eq!(restored, payload.as_bytes());
    }
}
