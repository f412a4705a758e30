// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Counts in-flight units of work so shutdown can wait for them to drain.
pub struct GracefulShutdownTracker {
    active: AtomicUsize,
    shutdown_complete: Notify,
}

impl std::fmt::Debug for GracefulShutdownTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulShutdownTracker")
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for GracefulShutdownTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdownTracker {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            shutdown_complete: Notify::new(),
        }
    }

    /// Register one unit of work. It is released when the guard drops.
    pub fn track(self: &Arc<Self>) -> InflightGuard {
        let count = self.active.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("Work registered, total active: {} -> {}", count, count + 1);
        InflightGuard {
            tracker: self.clone(),
        }
    }

    fn release(&self) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!("Work released, remaining active: {} -> {}", prev, prev - 1);
        if prev == 1 {
            self.shutdown_complete.notify_waiters();
        }
    }

    /// Get the current count of in-flight work
    pub fn get_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub async fn wait_for_completion(&self) {
        loop {
            // Create the waiter BEFORE checking the condition
            let notified = self.shutdown_complete.notified();

            let count = self.active.load(Ordering::SeqCst);
            if count == 0 {
                tracing::debug!("All in-flight work completed");
                break;
            }

            tracing::debug!("Waiting for {} in-flight units to complete", count);
            notified.await;
        }
    }

    /// Like [`Self::wait_for_completion`] but gives up after `grace`.
    /// Returns true if everything drained in time.
    pub async fn wait_for_completion_timeout(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.wait_for_completion())
            .await
            .is_ok()
    }
}

/// RAII registration with a [`GracefulShutdownTracker`]
pub struct InflightGuard {
    tracker: Arc<GracefulShutdownTracker>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let tracker = Arc::new(GracefulShutdownTracker::new());
        assert!(
            tracker
                .wait_for_completion_timeout(Duration::from_millis(10))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_guards() {
        let tracker = Arc::new(GracefulShutdownTracker::new());
        let a = tracker.track();
        let b = tracker.track();
        assert_eq!(tracker.get_count(), 2);

        let t = tracker.clone();
        let waiter = tokio::spawn(async move { t.wait_for_completion().await });

        drop(a);
        assert!(!waiter.is_finished());
        drop(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert_eq!(tracker.get_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_timeout_expires() {
        let tracker = Arc::new(GracefulShutdownTracker::new());
        let _busy = tracker.track();
        assert!(
            !tracker
                .wait_for_completion_timeout(Duration::from_millis(20))
                .await
        );
    }
}
