//! Executor worker process: bound to one queue shard, runs the plan/apply
//! pipeline for every stack it pulls.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use terraform_stack_controller::config;
use terraform_stack_controller::handler::records::K8sRecordStore;
use terraform_stack_controller::handler::{StackHandler, TfHandler};
use terraform_stack_controller::metrics;
use terraform_stack_controller::repository::{GitRepository, Repository};
use terraform_stack_controller::secrets::VaultClient;
use terraform_stack_controller::worker::{ordinal_from_hostname, Worker};

/// Terraform stack executor worker
#[derive(Parser, Debug)]
#[command(name = "stack-worker")]
struct Options {
    /// Shard index to poll; defaults to the pod's ordinal hostname suffix
    #[arg(long, env = "WORKER_SHARD")]
    shard: Option<usize>,

    /// Queue server base URL
    #[arg(long, env = "QUEUE_URL", default_value = "http://stack-queue:9090")]
    queue_url: String,

    /// Seconds to sleep between polls of an empty shard
    #[arg(long, env = "WORKER_POLL_INTERVAL_SECONDS", default_value_t = 5)]
    poll_interval: u64,
}

fn resolve_shard(options: &Options) -> Result<usize> {
    if let Some(shard) = options.shard {
        return Ok(shard);
    }
    let hostname = std::env::var("HOSTNAME").unwrap_or_default();
    ordinal_from_hostname(&hostname).context(format!(
        "No --shard given and hostname {hostname:?} carries no ordinal suffix"
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "terraform_stack_controller=info".into()),
        )
        .init();

    let options = Options::parse();
    let shard = resolve_shard(&options)?;
    metrics::register_metrics()?;

    info!("Starting stack worker for shard {}", shard);

    let client = Client::try_default().await?;
    let repository: Arc<dyn Repository> = Arc::new(GitRepository::new(
        client.clone(),
        config::controller_namespace(),
    ));
    let secrets = Arc::new(
        VaultClient::new(&config::SecretStoreConfig::from_env())
            .context("Failed to create secret store client")?,
    );
    let records = Arc::new(K8sRecordStore::new(client.clone()));
    let handler: Arc<dyn StackHandler> = Arc::new(TfHandler::new(
        Arc::clone(&repository),
        secrets,
        records,
        config::ExecConfig::from_env(),
    ));

    let mut worker = Worker::new(
        client,
        &options.queue_url,
        handler,
        repository,
        shard,
        Duration::from_secs(options.poll_interval),
    )?;
    worker.run().await
}
