// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Durable FIFO of sync tasks on top of the key-value store.
//!
//! Tasks live in the `tasks` bucket under keys that sort in enqueue order.
//! A worker owns a task while it holds the matching entry in `task_leases`,
//! created with a create-only write. A lease older than the lease TTL belongs
//! to a dead worker and may be broken. Tasks are removed only once handled or
//! out of attempts, so delivery is at least once.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use llamero_runtime::storage::key_value_store::{Key, KeyValueStoreManager, StoreOutcome};

use super::{QueueError, SyncTask, TaskEnqueuer};
use crate::config::WorkerConfig;

pub const TASKS_BUCKET: &str = "tasks";
pub const LEASES_BUCKET: &str = "task_leases";

/// A stored task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Not claimable before this instant
    pub not_before: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    owner: String,
    claimed_at: DateTime<Utc>,
}

/// A task this worker holds the lease of
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    key: Key,
    pub envelope: TaskEnvelope,
}

impl ClaimedTask {
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    pub fn task(&self) -> Result<SyncTask, QueueError> {
        SyncTask::from_parts(&self.envelope.kind, self.envelope.payload.as_ref())
    }
}

/// What happened to a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the queue, claimable after the delay
    Retry(Duration),

    /// Out of attempts and removed
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(config: &WorkerConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            base_backoff: config.retry_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (1-based), capped at
    /// `max_backoff`, with up to 10% jitter added.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    store: KeyValueStoreManager,
    policy: RetryPolicy,
    lease_ttl: Duration,
    owner: String,
    last_sequence: Arc<AtomicI64>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("store", &self.store)
            .field("owner", &self.owner)
            .finish()
    }
}

impl TaskQueue {
    pub fn new(store: KeyValueStoreManager, policy: RetryPolicy, lease_ttl: Duration) -> Self {
        TaskQueue {
            owner: format!("{:x}-{}", store.connection_id(), uuid::Uuid::new_v4().simple()),
            store,
            policy,
            lease_ttl,
            last_sequence: Arc::new(AtomicI64::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(store: KeyValueStoreManager, config: &WorkerConfig) -> Self {
        Self::new(store, RetryPolicy::from(config), config.lease_ttl)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Nanoseconds since the epoch, strictly increasing within this process
    fn next_sequence(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last_sequence.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_sequence.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    pub async fn push(&self, task: &SyncTask) -> Result<String, QueueError> {
        let now = Utc::now();
        let id = format!("{:020}-{}", self.next_sequence(), uuid::Uuid::new_v4().simple());
        let envelope = TaskEnvelope {
            id: id.clone(),
            kind: task.kind().to_string(),
            payload: task.payload(),
            attempts: 0,
            enqueued_at: now,
            not_before: now,
            last_error: None,
        };
        self.store
            .save(TASKS_BUCKET, &Key::from(id.as_str()), &envelope)
            .await?;
        tracing::debug!(task_id = %id, %task, "Task enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Tasks stored, claimed or not
    pub async fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.store.list::<TaskEnvelope>(TASKS_BUCKET).await?.len())
    }

    /// Oldest due task not leased by a live worker
    pub async fn claim(&self) -> Result<Option<ClaimedTask>, QueueError> {
        let now = Utc::now();
        for (key, envelope) in self.store.list::<TaskEnvelope>(TASKS_BUCKET).await? {
            if envelope.not_before > now {
                continue;
            }
            if !self.try_lease(&key, now).await? {
                continue;
            }
            // completed by another worker between listing and leasing
            match self.store.load::<TaskEnvelope>(TASKS_BUCKET, &key).await? {
                Some(envelope) => return Ok(Some(ClaimedTask { key, envelope })),
                None => {
                    self.store.remove(LEASES_BUCKET, &key).await?;
                }
            }
        }
        Ok(None)
    }

    async fn try_lease(&self, key: &Key, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let lease = Lease {
            owner: self.owner.clone(),
            claimed_at: now,
        };
        if self.store.create(LEASES_BUCKET, key, &lease).await? == StoreOutcome::Created {
            return Ok(true);
        }

        let Some(held) = self.store.load::<Lease>(LEASES_BUCKET, key).await? else {
            // released in the meantime, next scan picks it up
            return Ok(false);
        };
        let age = (now - held.claimed_at).to_std().unwrap_or_default();
        if age < self.lease_ttl {
            return Ok(false);
        }
        tracing::warn!(task_id = %key, owner = %held.owner, ?age, "Breaking stale task lease");
        self.store.remove(LEASES_BUCKET, key).await?;
        Ok(self.store.create(LEASES_BUCKET, key, &lease).await? == StoreOutcome::Created)
    }

    /// The task succeeded: forget it
    pub async fn complete(&self, claimed: &ClaimedTask) -> Result<(), QueueError> {
        self.store.remove(TASKS_BUCKET, &claimed.key).await?;
        self.store.remove(LEASES_BUCKET, &claimed.key).await?;
        Ok(())
    }

    /// The task failed: schedule a retry or drop it when out of attempts
    pub async fn fail(&self, claimed: &ClaimedTask, error: &str) -> Result<FailOutcome, QueueError> {
        let mut envelope = claimed.envelope.clone();
        envelope.attempts += 1;
        envelope.last_error = Some(error.to_string());

        if envelope.attempts >= self.policy.max_attempts {
            tracing::error!(
                task_id = %envelope.id,
                kind = %envelope.kind,
                attempts = envelope.attempts,
                error,
                "Task failed too many times, dropping"
            );
            self.complete(claimed).await?;
            return Ok(FailOutcome::Dropped);
        }

        let delay = self.policy.backoff(envelope.attempts);
        envelope.not_before = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store.save(TASKS_BUCKET, &claimed.key, &envelope).await?;
        self.store.remove(LEASES_BUCKET, &claimed.key).await?;
        tracing::warn!(
            task_id = %envelope.id,
            kind = %envelope.kind,
            attempts = envelope.attempts,
            ?delay,
            error,
            "Task failed, will retry"
        );
        Ok(FailOutcome::Retry(delay))
    }

    /// Sleep until a task is pushed by this process or `timeout` elapses
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

#[async_trait]
impl TaskEnqueuer for TaskQueue {
    async fn enqueue(&self, task: SyncTask) -> Result<String, QueueError> {
        self.push(&task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    fn queue(max_attempts: u32) -> TaskQueue {
        TaskQueue::new(
            KeyValueStoreManager::memory(),
            policy(max_attempts),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_fifo_claim_and_complete() -> anyhow::Result<()> {
        let q = queue(3);
        q.push(&SyncTask::FullSync).await?;
        q.push(&SyncTask::sync_backend("a")?).await?;
        q.push(&SyncTask::sync_backend("b")?).await?;
        assert_eq!(q.pending().await?, 3);

        let first = q.claim().await?.expect("task");
        assert_eq!(first.task()?, SyncTask::FullSync);
        // leased tasks are not handed out twice
        let second = q.claim().await?.expect("task");
        assert_eq!(second.task()?, SyncTask::SyncBackend("a".into()));

        q.complete(&first).await?;
        q.complete(&second).await?;
        let third = q.claim().await?.expect("task");
        assert_eq!(third.task()?, SyncTask::SyncBackend("b".into()));
        assert!(q.claim().await?.is_none());

        q.complete(&third).await?;
        assert_eq!(q.pending().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_task_is_delayed_then_dropped() -> anyhow::Result<()> {
        let q = queue(2);
        q.push(&SyncTask::FullSync).await?;

        let claimed = q.claim().await?.expect("task");
        let outcome = q.fail(&claimed, "registry down").await?;
        assert_matches!(outcome, FailOutcome::Retry(d) if d >= Duration::from_millis(100));
        // backing off
        assert!(q.claim().await?.is_none());
        assert_eq!(q.pending().await?, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let claimed = q.claim().await?.expect("due again");
        assert_eq!(claimed.envelope.attempts, 1);
        assert_eq!(claimed.envelope.last_error.as_deref(), Some("registry down"));

        assert_eq!(q.fail(&claimed, "still down").await?, FailOutcome::Dropped);
        assert_eq!(q.pending().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_lease_is_broken() -> anyhow::Result<()> {
        let store = KeyValueStoreManager::memory();
        let dead = TaskQueue::new(store.clone(), policy(3), Duration::from_millis(50));
        let live = TaskQueue::new(store, policy(3), Duration::from_millis(50));

        dead.push(&SyncTask::FullSync).await?;
        let abandoned = dead.claim().await?.expect("task");
        assert!(live.claim().await?.is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let recovered = live.claim().await?.expect("lease expired");
        assert_eq!(recovered.id(), abandoned.id());
        Ok(())
    }

    #[tokio::test]
    async fn test_queue_survives_restart_on_file_store() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let before = TaskQueue::new(
            KeyValueStoreManager::file(dir.path()),
            policy(3),
            Duration::from_secs(60),
        );
        before.push(&SyncTask::sync_backend("gpu-a")?).await?;
        drop(before);

        let after = TaskQueue::new(
            KeyValueStoreManager::file(dir.path()),
            policy(3),
            Duration::from_secs(60),
        );
        let claimed = after.claim().await?.expect("persisted");
        assert_eq!(claimed.task()?, SyncTask::SyncBackend("gpu-a".into()));
        Ok(())
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy(10);
        let first = p.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let third = p.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(440));
        let capped = p.backoff(30);
        assert!(capped >= Duration::from_secs(1) && capped <= Duration::from_millis(1100));
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let q = queue(1);
        let a = q.next_sequence();
        let b = q.next_sequence();
        assert!(b > a);
    }
}
