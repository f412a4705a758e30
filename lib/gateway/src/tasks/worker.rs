// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use llamero_runtime::GracefulShutdownTracker;

use super::SyncTask;
use super::queue::{ClaimedTask, TaskQueue};
use crate::config::WorkerConfig;
use crate::sync::{SyncEngine, SyncError};

/// Runs one task. An error sends the task back to the queue for a retry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &SyncTask) -> anyhow::Result<()>;
}

/// Feeds sync tasks to the [`SyncEngine`]
pub struct SyncTaskHandler {
    engine: SyncEngine,
}

impl SyncTaskHandler {
    pub fn new(engine: SyncEngine) -> Self {
        SyncTaskHandler { engine }
    }
}

#[async_trait]
impl TaskHandler for SyncTaskHandler {
    async fn handle(&self, task: &SyncTask) -> anyhow::Result<()> {
        match task {
            SyncTask::FullSync => {
                let summary = self.engine.sync_all().await?;
                tracing::info!(
                    healthy = summary.healthy,
                    unhealthy = summary.unhealthy,
                    skipped = summary.skipped,
                    "Backends synced"
                );
                Ok(())
            }
            SyncTask::SyncBackend(id) => match self.engine.sync_one(id).await {
                Ok(_) => Ok(()),
                // retrying cannot fix these
                Err(err @ (SyncError::NotFound(_) | SyncError::MissingAddress(_))) => {
                    tracing::warn!(backend = %id, %err, "Skipping backend sync");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            },
        }
    }
}

/// Claims tasks from the queue and runs up to `concurrency` of them at once.
pub struct WorkerPool {
    queue: TaskQueue,
    handler: Arc<dyn TaskHandler>,
    concurrency: usize,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn new(queue: TaskQueue, handler: Arc<dyn TaskHandler>, config: &WorkerConfig) -> Self {
        WorkerPool {
            queue,
            handler,
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Process tasks until `cancel_token` fires, then wait up to the shutdown
    /// grace period for in-flight tasks. Tasks still running after that keep
    /// their lease and are picked up again once it expires.
    pub async fn run(self, cancel_token: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(concurrency = self.concurrency, "Worker pool started");
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let tracker = Arc::new(GracefulShutdownTracker::new());

        loop {
            let permit = tokio::select! {
                _ = cancel_token.cancelled() => break,
                permit = slots.clone().acquire_owned() => permit?,
            };

            let claimed = match self.queue.claim().await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = self.queue.wait(self.poll_interval) => continue,
                    }
                }
                Err(err) => {
                    drop(permit);
                    tracing::error!(%err, "Failed claiming task");
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
            };

            let guard = tracker.track();
            let queue = self.queue.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                process(&queue, handler.as_ref(), claimed).await;
            });
        }

        tracing::info!(
            in_flight = tracker.get_count(),
            "Worker pool stopping, draining tasks"
        );
        if !tracker.wait_for_completion_timeout(self.shutdown_grace).await {
            tracing::warn!(
                remaining = tracker.get_count(),
                grace = %humantime::format_duration(self.shutdown_grace),
                "Shutdown grace period elapsed with tasks still running"
            );
        }
        Ok(())
    }
}

async fn process(queue: &TaskQueue, handler: &dyn TaskHandler, claimed: ClaimedTask) {
    let task = match claimed.task() {
        Ok(task) => task,
        Err(err) => {
            tracing::error!(task_id = %claimed.id(), kind = %claimed.envelope.kind, %err, "Dropping undecodable task");
            if let Err(err) = queue.complete(&claimed).await {
                tracing::error!(task_id = %claimed.id(), %err, "Failed removing task");
            }
            return;
        }
    };

    tracing::debug!(task_id = %claimed.id(), %task, "Running task");
    let result = match handler.handle(&task).await {
        Ok(()) => queue.complete(&claimed).await.map(|_| ()),
        Err(err) => queue.fail(&claimed, &format!("{err:#}")).await.map(|_| ()),
    };
    if let Err(err) = result {
        tracing::error!(task_id = %claimed.id(), %err, "Failed updating task queue");
    }
}
