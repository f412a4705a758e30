// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Refreshes backend health and model lists from probes.
//!
//! Probe failures only flip `healthy`; the last known model lists are kept.
//! Registry failures are the only errors returned to callers.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::config::BackendDefinition;
use crate::metrics::Metrics;
use crate::probe::ModelProbe;
use crate::registry::{BackendRegistry, BackendState, DEFAULT_ORDERING_SCORE, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("backend {0:?} not found")]
    NotFound(String),

    #[error("backend {0:?} missing address")]
    MissingAddress(String),

    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for SyncError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => SyncError::NotFound(id),
            other => SyncError::Registry(other),
        }
    }
}

/// Outcome of one pass over every backend
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub healthy: usize,
    pub unhealthy: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct SyncEngine {
    registry: BackendRegistry,
    probe: Arc<dyn ModelProbe>,
    metrics: Option<Arc<Metrics>>,
}

impl SyncEngine {
    pub fn new(registry: BackendRegistry, probe: Arc<dyn ModelProbe>) -> Self {
        SyncEngine {
            registry,
            probe,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Reconcile the registry with `defs` and drop the metric series of
    /// every backend it removed.
    pub async fn reconcile(&self, defs: &[BackendDefinition]) -> Result<Vec<String>, RegistryError> {
        let removed = self.registry.reconcile(defs).await?;
        if let Some(metrics) = &self.metrics {
            for id in &removed {
                metrics.forget_backend(id);
            }
        }
        Ok(removed)
    }

    /// Refresh one backend by id.
    pub async fn sync_one(&self, id: &str) -> Result<BackendState, SyncError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(SyncError::NotFound(id.to_string()));
        }
        let state = self.registry.get(id).await?;
        self.refresh(state).await
    }

    /// Refresh every registered backend, one after another.
    ///
    /// Keeps going past failures and returns the first registry error once
    /// every backend had its turn. A backend without address is skipped.
    pub async fn sync_all(&self) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::default();
        let mut first_err = None;
        for state in self.registry.list().await? {
            let id = state.id.clone();
            match self.refresh(state).await {
                Ok(state) if state.healthy => summary.healthy += 1,
                Ok(_) => summary.unhealthy += 1,
                Err(SyncError::MissingAddress(_)) => {
                    tracing::warn!(backend = %id, "Skipping backend without address");
                    summary.skipped += 1;
                }
                Err(err) => {
                    tracing::error!(backend = %id, %err, "Failed saving backend state");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_sync_error();
                    }
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    async fn refresh(&self, mut state: BackendState) -> Result<BackendState, SyncError> {
        if !state.has_address() {
            return Err(SyncError::MissingAddress(state.id));
        }

        let start = Instant::now();
        let result = self.probe.probe(&state.address).await;
        state.latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        state.healthy = result.is_ok();
        match result {
            Ok(report) => {
                state.models = report.installed;
                state.loaded_models = report.loaded;
                state.model_meta = report.meta;
            }
            Err(err) => {
                tracing::warn!(backend = %state.id, address = %state.address, %err, "Backend probe failed");
            }
        }
        state.updated_at = Utc::now();

        self.registry.save(&state, DEFAULT_ORDERING_SCORE).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_sync(&state.id, state.healthy, state.latency_ms);
        }
        tracing::debug!(
            backend = %state.id,
            healthy = state.healthy,
            latency_ms = state.latency_ms,
            models = state.models.len(),
            loaded = state.loaded_models.len(),
            "Backend synced"
        );
        Ok(state)
    }
}
