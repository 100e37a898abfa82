//! # Configuration
//!
//! Environment-derived settings for the controller, queue server, and
//! worker processes. Values follow the deployment conventions: everything
//! has a default that works in-cluster, overridable per environment.

use std::path::PathBuf;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Namespace the control plane runs in; repo credentials are looked up here.
pub fn controller_namespace() -> String {
    env_or("POD_NAMESPACE", "octopilot-system")
}

/// Settings for the terraform execution pipeline.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Program invoked for plan/apply; overridable for stub binaries in tests.
    pub terraform_bin: PathBuf,
    /// Root under which per-stack working directories are created.
    pub workdir_root: PathBuf,
    /// Remote-state backend wiring injected at init time, never committed to
    /// source: consul address and scheme. The state path is derived per stack.
    pub backend_address: String,
    pub backend_scheme: String,
}

impl ExecConfig {
    pub fn from_env() -> Self {
        Self {
            terraform_bin: PathBuf::from(env_or("TERRAFORM_BIN", "terraform")),
            workdir_root: PathBuf::from(env_or("WORKDIR_ROOT", "/tmp/tf-workdirs")),
            backend_address: env_or("CONSUL_ADDRESS", "consul-server:8500"),
            backend_scheme: env_or("CONSUL_SCHEME", "http"),
        }
    }
}

/// Settings for the versioned secret store.
#[derive(Debug, Clone)]
pub struct SecretStoreConfig {
    pub address: String,
    pub token: String,
    /// Secret reads are secondary network calls and get a short timeout.
    pub timeout: Duration,
}

impl SecretStoreConfig {
    pub fn from_env() -> Self {
        Self {
            address: env_or("VAULT_ADDR", "http://vault:8200"),
            token: env_or("VAULT_TOKEN", ""),
            timeout: Duration::from_secs(env_parse("VAULT_TIMEOUT_SECONDS", 5)),
        }
    }
}

/// Settings shared by queue producers and consumers.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub url: String,
    /// Number of fixed shards; must agree between server and workers.
    pub shards: usize,
    /// Bounded capacity per shard; a full shard blocks the pusher.
    pub capacity: usize,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_or("QUEUE_URL", "http://stack-queue:9090"),
            shards: env_parse("QUEUE_SHARDS", 4),
            capacity: env_parse("QUEUE_CAPACITY", 64),
        }
    }
}

/// Fixed interval between scheduled reconciliations of every stack.
pub fn reconcile_interval() -> Duration {
    Duration::from_secs(env_parse("RECONCILE_INTERVAL_SECONDS", 300))
}

/// Upper bound on one worker cycle for a single stack. The in-flight
/// terraform process is not killed when this elapses; it runs to completion
/// while the worker moves on.
pub fn worker_handle_timeout() -> Duration {
    Duration::from_secs(env_parse("WORKER_HANDLE_TIMEOUT_SECONDS", 1200))
}

/// Port for the controller's metrics/probe/apply HTTP server.
pub fn metrics_port() -> u16 {
    env_parse("METRICS_PORT", 8080)
}
