// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{SyncTask, TaskEnqueuer};

/// Enqueues a full sync every `interval`, starting immediately.
pub struct Scheduler {
    enqueuer: Arc<dyn TaskEnqueuer>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(enqueuer: Arc<dyn TaskEnqueuer>, interval: Duration) -> Self {
        Scheduler { enqueuer, interval }
    }

    pub async fn run(self, cancel_token: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(
            interval = %humantime::format_duration(self.interval),
            "Scheduler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.enqueuer.enqueue(SyncTask::FullSync).await {
                Ok(id) => tracing::debug!(task_id = %id, "Scheduled full sync"),
                Err(err) => tracing::error!(%err, "Failed scheduling full sync"),
            }
        }
        tracing::info!("Scheduler stopped");
        Ok(())
    }
}
