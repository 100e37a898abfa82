//! # Terraform Execution Pipeline
//!
//! Wraps one working directory and drives the external `terraform` binary
//! through init, plan, and apply/destroy, capturing stdout/stderr per call.
//!
//! Init always runs secret rewriting and backend verification first, then
//! injects the remote-state backend wiring as `-backend-config` arguments.
//! Plan and apply have no timeout of their own: they are long-running,
//! human-relevant operations and block the caller for their full duration.

use crate::config::ExecConfig;
use crate::parser::{self, ConfigError};
use crate::secrets::SecretStore;
use anyhow::Context;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Captured output of one terraform invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl ExecOutput {
    /// Stdout and stderr stitched together for the persisted record.
    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// Fatal to the cycle before any terraform process was started.
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("terraform {op} failed (exit {code}): {}", .stderr.trim())]
    Terraform {
        op: &'static str,
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecError {
    /// Full output of the failed step, for the persisted record.
    pub fn output(&self) -> String {
        match self {
            ExecError::Terraform { stdout, stderr, .. } => {
                if stderr.trim().is_empty() {
                    stdout.clone()
                } else {
                    format!("{stdout}\n{stderr}")
                }
            }
            other => other.to_string(),
        }
    }
}

/// One working directory wired to a stack's backend state path.
#[derive(Debug)]
pub struct TerraformExec {
    config: ExecConfig,
    /// Directory holding the stack's configuration files (the checkout root
    /// joined with the repo path).
    dir: PathBuf,
    /// Remote-state path for this stack, injected at init.
    state_path: String,
    /// Extra `-backend-config` pairs from the stack spec.
    backend_config: BTreeMap<String, String>,
}

impl TerraformExec {
    pub fn new(
        config: ExecConfig,
        dir: PathBuf,
        state_path: String,
        backend_config: Option<&BTreeMap<String, String>>,
    ) -> Self {
        Self {
            config,
            dir,
            state_path,
            backend_config: backend_config.cloned().unwrap_or_default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Arguments injected at init time; the backend block in source stays
    /// empty by contract.
    fn init_args(&self) -> Vec<String> {
        let mut args = vec![
            "init".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            format!("-backend-config=address={}", self.config.backend_address),
            format!("-backend-config=scheme={}", self.config.backend_scheme),
            format!("-backend-config=path={}", self.state_path),
        ];
        for (key, value) in &self.backend_config {
            args.push(format!("-backend-config={key}={value}"));
        }
        args
    }

    /// Rewrite secrets, verify the backend declaration, and run
    /// `terraform init`. A failed backend check is fatal to the whole cycle:
    /// no terraform process is started.
    pub async fn init(
        &self,
        project: &str,
        store: &dyn SecretStore,
    ) -> Result<ExecOutput, ExecError> {
        parser::rewrite_secrets(&self.dir, project, store).await?;
        let backend_file = parser::check_backend(&self.dir)?;
        debug!("Backend declared in {}", backend_file.display());

        let args = self.init_args();
        self.run("init", &args).await
    }

    /// Run `terraform plan`. Returns whether the plan shows a difference
    /// between configuration and live state (detailed exit code: 0 = clean,
    /// 2 = diff, anything else = failure).
    pub async fn plan(&self, targets: Option<&[String]>) -> Result<(bool, ExecOutput), ExecError> {
        let mut args = vec![
            "plan".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-detailed-exitcode".to_string(),
        ];
        push_targets(&mut args, targets);

        let output = self.run_raw("plan", &args).await?;
        match output.code {
            0 => Ok((false, output)),
            2 => Ok((true, output)),
            code => Err(ExecError::Terraform {
                op: "plan",
                code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        }
    }

    pub async fn apply(&self, targets: Option<&[String]>) -> Result<ExecOutput, ExecError> {
        let mut args = vec![
            "apply".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-auto-approve".to_string(),
        ];
        push_targets(&mut args, targets);
        self.run("apply", &args).await
    }

    pub async fn destroy(&self) -> Result<ExecOutput, ExecError> {
        let args = vec![
            "apply".to_string(),
            "-destroy".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-auto-approve".to_string(),
        ];
        self.run("destroy", &args).await
    }

    /// Run terraform and require a zero exit.
    async fn run(&self, op: &'static str, args: &[String]) -> Result<ExecOutput, ExecError> {
        let output = self.run_raw(op, args).await?;
        if output.code != 0 {
            return Err(ExecError::Terraform {
                op,
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    async fn run_raw(&self, op: &str, args: &[String]) -> Result<ExecOutput, ExecError> {
        info!("Running terraform {} in {}", op, self.dir.display());
        let output = Command::new(&self.config.terraform_bin)
            .args(args)
            .current_dir(&self.dir)
            .output()
            .await
            .context(format!(
                "Failed to execute {} {}",
                self.config.terraform_bin.display(),
                op
            ))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}

fn push_targets(args: &mut Vec<String>, targets: Option<&[String]>) {
    if let Some(targets) = targets {
        for target in targets {
            args.push(format!("-target={target}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> TerraformExec {
        let mut backend = BTreeMap::new();
        backend.insert("lock".to_string(), "true".to_string());
        TerraformExec::new(
            ExecConfig {
                terraform_bin: "terraform".into(),
                workdir_root: "/tmp".into(),
                backend_address: "consul-server:8500".into(),
                backend_scheme: "http".into(),
            },
            "/tmp/demo".into(),
            "terraform/infra/demo".into(),
            Some(&backend),
        )
    }

    #[test]
    fn init_args_inject_backend_wiring() {
        let args = exec().init_args();
        assert_eq!(args[0], "init");
        assert!(args.contains(&"-backend-config=address=consul-server:8500".to_string()));
        assert!(args.contains(&"-backend-config=scheme=http".to_string()));
        assert!(args.contains(&"-backend-config=path=terraform/infra/demo".to_string()));
        assert!(args.contains(&"-backend-config=lock=true".to_string()));
    }

    #[test]
    fn targets_append_target_flags() {
        let mut args = vec!["plan".to_string()];
        push_targets(
            &mut args,
            Some(&["module.vpc".to_string(), "aws_instance.web".to_string()]),
        );
        assert_eq!(
            args,
            vec![
                "plan".to_string(),
                "-target=module.vpc".to_string(),
                "-target=aws_instance.web".to_string(),
            ]
        );
    }

    #[test]
    fn combined_output_skips_empty_stderr() {
        let output = ExecOutput {
            stdout: "ok".into(),
            stderr: String::new(),
            code: 0,
        };
        assert_eq!(output.combined(), "ok");
        let with_err = ExecOutput {
            stdout: "ok".into(),
            stderr: "warning".into(),
            code: 0,
        };
        assert_eq!(with_err.combined(), "ok\nwarning");
    }
}
