//! Work queue server process: owns the sharded channels and serves the
//! push/poll wire protocol.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use terraform_stack_controller::metrics;
use terraform_stack_controller::queue::server::{start_server, QueueServerState};
use terraform_stack_controller::queue::WorkQueue;

/// Terraform stack work queue server
#[derive(Parser, Debug)]
#[command(name = "queue-server")]
struct Options {
    /// Port to listen on
    #[arg(long, env = "QUEUE_PORT", default_value_t = 9090)]
    port: u16,

    /// Number of fixed shards; must match the worker fleet size
    #[arg(long, env = "QUEUE_SHARDS", default_value_t = 4)]
    shards: usize,

    /// Bounded capacity per shard; a full shard blocks pushers
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 64)]
    capacity: usize,
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
    metrics::register_metrics()?;

    info!(
        "Starting queue server with {} shards (capacity {} each)",
        options.shards, options.capacity
    );

    let state = Arc::new(QueueServerState {
        queue: WorkQueue::new(options.shards, options.capacity),
    });
    start_server(options.port, state).await
}
