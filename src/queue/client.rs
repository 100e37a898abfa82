//! # Work Queue Client
//!
//! Caller side of the queue wire protocol. The reconciler pushes; workers
//! poll their own shard. Push carries no timeout on purpose: a full shard
//! blocks the pusher, and that back-pressure must reach the reconciler.

use crate::crd::TerraformStack;
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::debug;

/// Timeout for polls and readiness probes; never applied to push.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct QueueClient {
    base_url: String,
    http: reqwest::Client,
}

impl QueueClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to create queue HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Enqueue a stack. Blocks for as long as the server needs to find
    /// capacity on the stack's shard.
    pub async fn push(&self, stack: &TerraformStack) -> Result<()> {
        let url = format!("{}/v1/queue/push", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(stack)
            .send()
            .await
            .context("Failed to push stack onto the work queue")?;
        if !response.status().is_success() {
            anyhow::bail!("queue push returned {}", response.status());
        }
        Ok(())
    }

    /// Poll one stack from a shard. `None` when the shard is empty.
    pub async fn poll(&self, shard: usize) -> Result<Option<TerraformStack>> {
        let url = format!("{}/v1/queue/poll/{}", self.base_url, shard);
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Failed to poll the work queue")?;

        match response.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let stack: TerraformStack = response
                    .json()
                    .await
                    .context("Malformed stack payload from the work queue")?;
                Ok(Some(stack))
            }
            status => anyhow::bail!("queue poll returned {}", status),
        }
    }

    /// Whether the queue server answers its readiness probe. Workers check
    /// this before each poll and rebuild the connection when it fails.
    pub async fn ready(&self) -> bool {
        let url = format!("{}/readyz", self.base_url);
        match self.http.get(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Queue readiness probe failed: {}", e);
                false
            }
        }
    }
}
