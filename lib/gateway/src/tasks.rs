// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background sync work.
//!
//! [`SyncTask`]s are stored in a durable [`queue::TaskQueue`], produced by the
//! [`scheduler::Scheduler`] and by the proxy after admin mutations, and consumed
//! at least once by a [`worker::WorkerPool`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use llamero_runtime::storage::key_value_store::StoreError;

pub mod queue;
pub mod scheduler;
pub mod worker;

pub use queue::{RetryPolicy, TaskQueue};

pub const TYPE_SYNC_BACKENDS: &str = "backends:sync";
pub const TYPE_SYNC_BACKEND_BY_ID: &str = "backends:sync_by_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTask {
    /// Refresh every backend
    FullSync,

    /// Refresh one backend by id
    SyncBackend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBackendPayload {
    pub backend_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("backend id is required")]
    MissingBackendId,

    #[error("unknown task type {0:?}")]
    UnknownKind(String),

    #[error("decode payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("task store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncTask {
    pub fn sync_backend(id: &str) -> Result<SyncTask, QueueError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(QueueError::MissingBackendId);
        }
        Ok(SyncTask::SyncBackend(id.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncTask::FullSync => TYPE_SYNC_BACKENDS,
            SyncTask::SyncBackend(_) => TYPE_SYNC_BACKEND_BY_ID,
        }
    }

    /// Empty for a full sync, `{"backend_id": ...}` otherwise
    pub fn payload(&self) -> Option<serde_json::Value> {
        match self {
            SyncTask::FullSync => None,
            SyncTask::SyncBackend(id) => Some(serde_json::json!({ "backend_id": id })),
        }
    }

    pub fn from_parts(kind: &str, payload: Option<&serde_json::Value>) -> Result<SyncTask, QueueError> {
        match kind {
            TYPE_SYNC_BACKENDS => Ok(SyncTask::FullSync),
            TYPE_SYNC_BACKEND_BY_ID => {
                let payload: SyncBackendPayload =
                    serde_json::from_value(payload.cloned().unwrap_or_default())?;
                SyncTask::sync_backend(&payload.backend_id)
            }
            other => Err(QueueError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for SyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTask::FullSync => f.write_str(TYPE_SYNC_BACKENDS),
            SyncTask::SyncBackend(id) => write!(f, "{TYPE_SYNC_BACKEND_BY_ID}({id})"),
        }
    }
}

/// Anything that accepts sync tasks for later execution
#[async_trait]
pub trait TaskEnqueuer: Send + Sync {
    /// Returns the task id
    async fn enqueue(&self, task: SyncTask) -> Result<String, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_task_parts() {
        let task = SyncTask::sync_backend(" gpu-a ").expect("valid");
        assert_eq!(task, SyncTask::SyncBackend("gpu-a".into()));
        assert_eq!(task.kind(), "backends:sync_by_id");
        let payload = task.payload();
        assert_eq!(payload, Some(serde_json::json!({"backend_id": "gpu-a"})));
        assert_eq!(
            SyncTask::from_parts(task.kind(), payload.as_ref()).expect("decode"),
            task
        );

        assert_eq!(SyncTask::FullSync.kind(), "backends:sync");
        assert_eq!(SyncTask::FullSync.payload(), None);
        assert_eq!(
            SyncTask::from_parts("backends:sync", None).expect("decode"),
            SyncTask::FullSync
        );
    }

    #[test]
    fn test_task_rejects() {
        assert_matches!(SyncTask::sync_backend("  "), Err(QueueError::MissingBackendId));
        assert_matches!(
            SyncTask::from_parts("backends:sync_by_id", None),
            Err(QueueError::InvalidPayload(_))
        );
        assert_matches!(
            SyncTask::from_parts(
                "backends:sync_by_id",
                Some(&serde_json::json!({"backend_id": ""}))
            ),
            Err(QueueError::MissingBackendId)
        );
        assert_matches!(
            SyncTask::from_parts("backends:explode", None),
            Err(QueueError::UnknownKind(_))
        );
    }
}
