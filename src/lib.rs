//! # Terraform Stack Controller
//!
//! A Kubernetes control plane that continuously reconciles GitOps-managed
//! Terraform stacks against live cloud state.
//!
//! ## Overview
//!
//! 1. **Watching stacks** - a controller watches `TerraformStack` resources
//!    across all namespaces and pushes every relevant change (or a fixed
//!    drift-detection timer tick) onto a sharded work queue.
//! 2. **Sharded execution** - the queue server holds a fixed set of bounded
//!    channels; a stack's shard is a pure hash of its name, so all work for
//!    one stack lands on the same worker, one item at a time.
//! 3. **Plan/apply pipeline** - a worker resolves the tracked branch or tag
//!    to a commit, checks it out, rewrites embedded secret placeholders,
//!    verifies the mandatory remote-state backend, and runs terraform plan
//!    and - policy permitting - apply or destroy.
//! 4. **Audit records** - every changed plan and every apply attempt is
//!    persisted as a gzip-compressed result record owned by its stack.
//! 5. **Status discipline** - plan/apply/operation outcomes are merged back
//!    into the stack's status against the latest stored version, never as a
//!    blind overwrite.
//!
//! ## Processes
//!
//! - `terraform-stack-controller` - the watch loop plus probes/metrics and
//!   the synchronous apply endpoint.
//! - `queue-server` - the work distribution service.
//! - `stack-worker` - one executor per queue shard.
//! - `crdgen` - prints the CRD manifest.

pub mod annotations;
pub mod config;
pub mod crd;
pub mod handler;
pub mod metrics;
pub mod parser;
pub mod queue;
pub mod reconciler;
pub mod repository;
pub mod secrets;
pub mod server;
pub mod worker;

pub use crd::{
    ApplyHistory, GitRepoRef, OperationPhase, OperationStatus, SyncPolicy, SyncStatus,
    TerraformStack, TerraformStackSpec, TerraformStackStatus,
};
