//! # Stack Handler
//!
//! Orchestrates one reconciliation unit end to end: owns the working
//! directory for a (stack, UID) pair, drives the execution pipeline, and
//! persists plan/apply results.
//!
//! The handler is shared by two callers: the queue-driven worker and the
//! synchronous HTTP apply path. Only the queue path carries shard affinity;
//! the HTTP path can overlap with it (see `server`).

pub mod exec;
pub mod records;

use crate::config::ExecConfig;
use crate::crd::TerraformStack;
use crate::repository::Repository;
use crate::secrets::SecretStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use exec::TerraformExec;
use kube::ResourceExt;
use records::{RecordKind, RecordStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Plan/apply/destroy operations on one stack. Implemented by [`TfHandler`];
/// a trait so callers can be exercised against fakes.
#[async_trait]
pub trait StackHandler: Send + Sync {
    /// Plan the stack at `commit_id`. Returns whether the plan shows a
    /// difference; a changed plan is persisted as the stack's live plan
    /// record. The working directory is left in place for a following apply.
    async fn plan(&self, stack: &TerraformStack, commit_id: &str) -> Result<bool>;

    /// Apply the stack at `commit_id`, persisting the result under
    /// `history_id`. The working directory is removed afterwards on both
    /// success and failure.
    async fn apply(&self, stack: &TerraformStack, commit_id: &str, history_id: u64) -> Result<()>;

    /// Destroy the stack's managed resources at its last applied revision.
    /// A stack that was never applied is a no-op.
    async fn destroy(&self, stack: &TerraformStack) -> Result<()>;
}

/// Production handler wiring repository, secret store, and record store.
pub struct TfHandler {
    repository: Arc<dyn Repository>,
    secrets: Arc<dyn SecretStore>,
    records: Arc<dyn RecordStore>,
    exec_config: ExecConfig,
}

impl std::fmt::Debug for TfHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfHandler")
            .field("exec_config", &self.exec_config)
            .finish()
    }
}

impl TfHandler {
    pub fn new(
        repository: Arc<dyn Repository>,
        secrets: Arc<dyn SecretStore>,
        records: Arc<dyn RecordStore>,
        exec_config: ExecConfig,
    ) -> Self {
        Self {
            repository,
            secrets,
            records,
            exec_config,
        }
    }

    /// Working directory for a stack, keyed by (name, UID). The digest keeps
    /// the path stable across cycles and distinct across stack re-creations
    /// under the same name.
    pub fn workdir_for(&self, stack: &TerraformStack) -> PathBuf {
        let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
        let name = stack.name_any();
        let uid = stack.uid().unwrap_or_default();
        let digest = md5::compute(format!("{namespace}/{name}/{uid}"));
        self.exec_config.workdir_root.join(format!("{name}-{digest:x}"))
    }

    /// Remote-state path for a stack, injected into the backend at init.
    fn state_path(stack: &TerraformStack) -> String {
        let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
        format!("terraform/{}/{}", namespace, stack.name_any())
    }

    fn exec_for(&self, stack: &TerraformStack, workdir: &Path) -> TerraformExec {
        let config_path = stack.spec.repo.config_path();
        let dir = if config_path.is_empty() {
            workdir.to_path_buf()
        } else {
            workdir.join(config_path)
        };
        TerraformExec::new(
            self.exec_config.clone(),
            dir,
            Self::state_path(stack),
            stack.spec.backend_config.as_ref(),
        )
    }

    async fn checkout_and_init(
        &self,
        stack: &TerraformStack,
        commit_id: &str,
        workdir: &Path,
    ) -> Result<TerraformExec> {
        self.repository
            .checkout_commit(&stack.spec.repo.repo, commit_id, workdir)
            .await
            .context("Failed to checkout stack source")?;
        let exec = self.exec_for(stack, workdir);
        exec.init(&stack.spec.project, self.secrets.as_ref())
            .await
            .context("Failed to initialize working directory")?;
        Ok(exec)
    }

    async fn remove_workdir(&self, workdir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(workdir).await {
            if workdir.exists() {
                warn!("Failed to remove working directory {}: {}", workdir.display(), e);
            }
        }
    }
}

#[async_trait]
impl StackHandler for TfHandler {
    async fn plan(&self, stack: &TerraformStack, commit_id: &str) -> Result<bool> {
        let workdir = self.workdir_for(stack);
        let exec = self.checkout_and_init(stack, commit_id, &workdir).await?;

        let (changed, output) = exec
            .plan(stack.spec.apply_targets.as_deref())
            .await
            .context("Terraform plan failed")?;

        if changed {
            self.records
                .persist(stack, RecordKind::Plan, commit_id, &output.combined())
                .await
                .context("Failed to persist plan record")?;
            info!("Plan for {} at {} shows changes", stack.name_any(), commit_id);
        } else {
            debug!("Plan for {} at {} is clean", stack.name_any(), commit_id);
        }
        Ok(changed)
    }

    async fn apply(&self, stack: &TerraformStack, commit_id: &str, history_id: u64) -> Result<()> {
        let workdir = self.workdir_for(stack);

        // A directory left behind by Plan in the same cycle is already
        // checked out and initialized; reuse it as-is.
        let exec = if workdir.exists() {
            debug!("Reusing working directory {}", workdir.display());
            self.exec_for(stack, &workdir)
        } else {
            self.checkout_and_init(stack, commit_id, &workdir).await?
        };

        let result = exec.apply(stack.spec.apply_targets.as_deref()).await;

        let payload = match &result {
            Ok(output) => output.combined(),
            Err(e) => e.output(),
        };
        if let Err(e) = self
            .records
            .persist(stack, RecordKind::Apply { history_id }, commit_id, &payload)
            .await
        {
            warn!("Failed to persist apply record for {}: {:#}", stack.name_any(), e);
        }

        self.remove_workdir(&workdir).await;

        result
            .map(|_| info!("Applied {} at {} (history {})", stack.name_any(), commit_id, history_id))
            .context("Terraform apply failed")
    }

    async fn destroy(&self, stack: &TerraformStack) -> Result<()> {
        let status = stack.status_or_default();
        let Some(revision) = status.applied_revision().map(str::to_string) else {
            info!("Stack {} was never applied; destroy is a no-op", stack.name_any());
            return Ok(());
        };

        let workdir = self.workdir_for(stack);
        let exec = self.checkout_and_init(stack, &revision, &workdir).await?;
        let result = exec.destroy().await;
        self.remove_workdir(&workdir).await;

        result
            .map(|_| info!("Destroyed resources of {} at {}", stack.name_any(), revision))
            .context("Terraform destroy failed")
    }
}

#[cfg(test)]
mod tests {
    use super::records::testing::MemoryRecordStore;
    use super::*;
    use crate::crd::{GitRepoRef, TerraformStackSpec, TerraformStackStatus};
    use crate::secrets::testing::MemoryStore;
    use std::path::Path;
    use tempfile::TempDir;

    /// Fake repository that "checks out" fixture configuration files.
    struct FixtureRepo {
        files: Vec<(String, String)>,
    }

    #[async_trait]
    impl Repository for FixtureRepo {
        async fn get_last_commit_id(&self, _repo: &str, _revision: &str) -> Result<String> {
            Ok("c0ffee00".to_string())
        }

        async fn checkout_commit(
            &self,
            _repo: &str,
            _commit: &str,
            dest: &Path,
        ) -> Result<PathBuf> {
            if dest.exists() {
                tokio::fs::remove_dir_all(dest).await?;
            }
            tokio::fs::create_dir_all(dest).await?;
            for (name, content) in &self.files {
                tokio::fs::write(dest.join(name), content).await?;
            }
            Ok(dest.to_path_buf())
        }
    }

    const BACKEND_TF: &str = "terraform {\n  backend \"consul\" {}\n}\n";

    /// Stub terraform binary that logs each invocation next to itself. The
    /// plan exit code is read from a sibling `plan_exit` file (default 0).
    fn write_stub(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("terraform-stub");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             dir=\"$(cd \"$(dirname \"$0\")\" && pwd)\"\n\
             echo \"$@\" >> \"$dir/calls.log\"\n\
             if [ \"$1\" = plan ] && [ -f \"$dir/plan_exit\" ]; then\n\
               echo \"plan output\"\n\
               exit \"$(cat \"$dir/plan_exit\")\"\n\
             fi\n\
             echo \"$1 output\"\n\
             exit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    struct Fixture {
        _stub_dir: TempDir,
        _workdir_root: TempDir,
        stub_dir: PathBuf,
        handler: TfHandler,
        records: Arc<MemoryRecordStore>,
    }

    fn fixture(files: Vec<(String, String)>) -> Fixture {
        let stub_dir = TempDir::new().unwrap();
        let workdir_root = TempDir::new().unwrap();
        let terraform_bin = write_stub(stub_dir.path());
        let records = Arc::new(MemoryRecordStore::default());
        let handler = TfHandler::new(
            Arc::new(FixtureRepo { files }),
            Arc::new(MemoryStore::default()),
            Arc::clone(&records) as Arc<dyn RecordStore>,
            ExecConfig {
                terraform_bin,
                workdir_root: workdir_root.path().to_path_buf(),
                backend_address: "consul-server:8500".into(),
                backend_scheme: "http".into(),
            },
        );
        let stub = stub_dir.path().to_path_buf();
        Fixture {
            _stub_dir: stub_dir,
            _workdir_root: workdir_root,
            stub_dir: stub,
            handler,
            records,
        }
    }

    fn stack() -> TerraformStack {
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
        stack.metadata.namespace = Some("infra".into());
        stack.metadata.uid = Some("uid-1234".into());
        stack
    }

    #[tokio::test]
    async fn plan_with_diff_persists_record_and_keeps_workdir() {
        let fx = fixture(vec![("main.tf".into(), BACKEND_TF.into())]);
        std::fs::write(fx.stub_dir.join("plan_exit"), "2").unwrap();
        let stack = stack();

        let changed = fx.handler.plan(&stack, "c0ffee00").await.unwrap();
        assert!(changed);
        assert_eq!(fx.records.plan_records().len(), 1);
        assert!(fx.records.apply_records().is_empty());
        // Plan leaves the working directory in place for a following apply.
        assert!(fx.handler.workdir_for(&stack).exists());
    }

    #[tokio::test]
    async fn clean_plan_persists_nothing() {
        let fx = fixture(vec![("main.tf".into(), BACKEND_TF.into())]);
        let stack = stack();

        let changed = fx.handler.plan(&stack, "c0ffee00").await.unwrap();
        assert!(!changed);
        assert!(fx.records.names().is_empty());

        // No-op convergence: a second identical plan is also clean and still
        // writes nothing.
        let changed = fx.handler.plan(&stack, "c0ffee00").await.unwrap();
        assert!(!changed);
        assert!(fx.records.names().is_empty());
    }

    #[tokio::test]
    async fn missing_backend_aborts_before_terraform_runs() {
        let fx = fixture(vec![(
            "main.tf".into(),
            "resource \"null_resource\" \"x\" {}\n".into(),
        )]);
        let stack = stack();

        let err = fx.handler.plan(&stack, "c0ffee00").await.unwrap_err();
        assert!(format!("{err:#}").contains("backend"));
        // The stub was never invoked.
        assert!(calls(&fx.stub_dir).is_empty());
    }

    #[tokio::test]
    async fn apply_reuses_workdir_from_plan() {
        let fx = fixture(vec![("main.tf".into(), BACKEND_TF.into())]);
        std::fs::write(fx.stub_dir.join("plan_exit"), "2").unwrap();
        let stack = stack();

        fx.handler.plan(&stack, "c0ffee00").await.unwrap();
        fx.handler.apply(&stack, "c0ffee00", 1).await.unwrap();

        let log = calls(&fx.stub_dir);
        let inits = log.iter().filter(|l| l.starts_with("init")).count();
        assert_eq!(inits, 1, "apply after plan must not re-init: {log:?}");
        assert_eq!(fx.records.apply_records().len(), 1);
        assert_eq!(fx.records.apply_records()[0].0, 1);
        // Cleanup is unconditional after apply.
        assert!(!fx.handler.workdir_for(&stack).exists());
    }

    #[tokio::test]
    async fn apply_without_prior_plan_checks_out_fresh() {
        let fx = fixture(vec![("main.tf".into(), BACKEND_TF.into())]);
        let stack = stack();

        fx.handler.apply(&stack, "c0ffee00", 3).await.unwrap();

        let log = calls(&fx.stub_dir);
        assert!(log.iter().any(|l| l.starts_with("init")));
        assert!(log.iter().any(|l| l.starts_with("apply")));
        assert_eq!(fx.records.apply_records()[0].0, 3);
        assert!(!fx.handler.workdir_for(&stack).exists());
    }

    #[tokio::test]
    async fn destroy_is_noop_for_never_applied_stack() {
        let fx = fixture(vec![("main.tf".into(), BACKEND_TF.into())]);
        let stack = stack();

        fx.handler.destroy(&stack).await.unwrap();
        assert!(calls(&fx.stub_dir).is_empty());
    }

    #[tokio::test]
    async fn destroy_checks_out_last_applied_revision() {
        let fx = fixture(vec![("main.tf".into(), BACKEND_TF.into())]);
        let mut stack = stack();
        stack.status = Some(TerraformStackStatus {
            last_applied_revision: Some("c0ffee00".into()),
            ..Default::default()
        });

        fx.handler.destroy(&stack).await.unwrap();
        let log = calls(&fx.stub_dir);
        assert!(log.iter().any(|l| l.starts_with("init")));
        assert!(log.iter().any(|l| l.starts_with("apply -destroy")));
    }
}
