//! Controller process: watches `TerraformStack` resources, manages
//! finalizers, and feeds the work queue. Also serves probes, metrics, and
//! the synchronous apply endpoint.

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{Api, Client};
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use tracing::{error, info};

use terraform_stack_controller::config;
use terraform_stack_controller::crd::TerraformStack;
use terraform_stack_controller::handler::records::{K8sRecordStore, RecordStore};
use terraform_stack_controller::handler::{StackHandler, TfHandler};
use terraform_stack_controller::queue::client::QueueClient;
use terraform_stack_controller::reconciler::{self, Reconciler};
use terraform_stack_controller::repository::{GitRepository, Repository};
use terraform_stack_controller::secrets::VaultClient;
use terraform_stack_controller::server::{start_server, ServerState};
use terraform_stack_controller::metrics;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "terraform_stack_controller=info".into()),
        )
        .init();

    info!(
        "Starting Terraform Stack Controller (build {} at {})",
        env!("BUILD_GIT_HASH"),
        env!("BUILD_DATETIME")
    );

    metrics::register_metrics()?;

    let client = Client::try_default().await?;

    let repository: Arc<dyn Repository> = Arc::new(GitRepository::new(
        client.clone(),
        config::controller_namespace(),
    ));
    let secrets = Arc::new(
        VaultClient::new(&config::SecretStoreConfig::from_env())
            .context("Failed to create secret store client")?,
    );
    let records: Arc<dyn RecordStore> = Arc::new(K8sRecordStore::new(client.clone()));
    let handler: Arc<dyn StackHandler> = Arc::new(TfHandler::new(
        Arc::clone(&repository),
        secrets,
        Arc::clone(&records),
        config::ExecConfig::from_env(),
    ));

    let queue_config = config::QueueConfig::from_env();
    let queue = QueueClient::new(&queue_config.url)?;
    reconciler::warn_if_queue_unreachable(&queue).await;

    // HTTP server for probes, metrics, and the synchronous apply path.
    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        client: client.clone(),
        handler: Arc::clone(&handler),
        repository: Arc::clone(&repository),
        records,
    });
    let server_state_clone = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = start_server(config::metrics_port(), server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Watch all namespaces so stacks can live next to their workloads.
    let stacks: Api<TerraformStack> = Api::all(client.clone());
    let ctx = Arc::new(Reconciler::new(client, queue, handler));

    server_state
        .is_ready
        .store(true, std::sync::atomic::Ordering::Relaxed);

    Controller::new(stacks, watcher::Config::default())
        .shutdown_on_signal()
        .run(Reconciler::reconcile, Reconciler::error_policy, ctx)
        .for_each(|_| std::future::ready(()))
        .await;

    info!("Controller stopped");

    Ok(())
}
