//! # Work Queue
//!
//! Fixed set of bounded channels ("shards") distributing stacks to executor
//! workers. A stack's shard is a pure function of its name, so every work
//! item for a given stack lands on the same worker - the system's only
//! mutual-exclusion mechanism for that stack's execution.
//!
//! Push blocks while the target shard is full (back-pressure on the
//! reconciler); poll never blocks.

pub mod client;
pub mod server;

use crate::crd::TerraformStack;
use anyhow::Result;
use kube::ResourceExt;
use tokio::sync::mpsc;

/// Deterministic shard for a stack name: sum of character codes modulo the
/// shard count.
pub fn shard_for_name(name: &str, shard_count: usize) -> usize {
    let sum: u64 = name.chars().map(|c| c as u64).sum();
    (sum % shard_count as u64) as usize
}

/// In-process queue state owned by the queue server.
pub struct WorkQueue {
    /// Senders behind one coordinating lock, used only for push routing.
    senders: std::sync::Mutex<Vec<mpsc::Sender<TerraformStack>>>,
    /// Receivers are independently owned per shard; polling one shard takes
    /// no lock beyond its own.
    receivers: Vec<tokio::sync::Mutex<mpsc::Receiver<TerraformStack>>>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("shards", &self.receivers.len())
            .finish()
    }
}

impl WorkQueue {
    pub fn new(shard_count: usize, capacity: usize) -> Self {
        let shard_count = shard_count.max(1);
        let capacity = capacity.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut receivers = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            receivers.push(tokio::sync::Mutex::new(rx));
        }
        Self {
            senders: std::sync::Mutex::new(senders),
            receivers,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.receivers.len()
    }

    /// Enqueue a stack onto its shard. Blocks while the shard is full; this
    /// is a back-pressure valve, not an error.
    pub async fn push(&self, stack: TerraformStack) -> Result<usize> {
        let shard = shard_for_name(&stack.name_any(), self.shard_count());
        let sender = {
            let senders = self
                .senders
                .lock()
                .map_err(|_| anyhow::anyhow!("queue push lock poisoned"))?;
            senders[shard].clone()
        };
        sender
            .send(stack)
            .await
            .map_err(|_| anyhow::anyhow!("queue shard {} is closed", shard))?;
        Ok(shard)
    }

    /// Dequeue one stack from a shard, or `None` when the shard is empty.
    /// Never blocks.
    pub async fn poll(&self, shard: usize) -> Result<Option<TerraformStack>> {
        let Some(receiver) = self.receivers.get(shard) else {
            anyhow::bail!("shard {} out of range (shard count {})", shard, self.shard_count());
        };
        let mut receiver = receiver.lock().await;
        match receiver.try_recv() {
            Ok(stack) => Ok(Some(stack)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                anyhow::bail!("shard {} is closed", shard)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GitRepoRef, TerraformStackSpec};
    use std::time::Duration;

    fn stack(name: &str) -> TerraformStack {
        TerraformStack::new(
            name,
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
        )
    }

    #[test]
    fn shard_assignment_is_deterministic() {
        for name in ["payments", "network-prod", "a", ""] {
            let first = shard_for_name(name, 4);
            for _ in 0..10 {
                assert_eq!(shard_for_name(name, 4), first);
            }
            assert!(first < 4);
        }
    }

    #[test]
    fn shard_assignment_is_char_code_sum() {
        // "ab" = 97 + 98 = 195; 195 % 4 = 3.
        assert_eq!(shard_for_name("ab", 4), 3);
        assert_eq!(shard_for_name("ba", 4), 3);
    }

    #[tokio::test]
    async fn push_then_poll_round_trips() {
        let queue = WorkQueue::new(4, 8);
        let shard = queue.push(stack("payments")).await.unwrap();
        assert_eq!(shard, shard_for_name("payments", 4));

        let polled = queue.poll(shard).await.unwrap().unwrap();
        assert_eq!(polled.name_any(), "payments");
        // The shard is drained now.
        assert!(queue.poll(shard).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_on_empty_shard_returns_immediately() {
        let queue = WorkQueue::new(2, 2);
        assert!(queue.poll(0).await.unwrap().is_none());
        assert!(queue.poll(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_on_unknown_shard_is_an_error() {
        let queue = WorkQueue::new(2, 2);
        assert!(queue.poll(2).await.is_err());
    }

    #[tokio::test]
    async fn push_blocks_when_shard_is_full() {
        let queue = WorkQueue::new(1, 2);
        queue.push(stack("a")).await.unwrap();
        queue.push(stack("a")).await.unwrap();

        // Third push must park until a poll frees capacity.
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.push(stack("a"))).await;
        assert!(blocked.is_err(), "push into a full shard should block");

        queue.poll(0).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_millis(200), queue.push(stack("a")))
            .await
            .expect("push should proceed once capacity frees")
            .unwrap();
    }
}
