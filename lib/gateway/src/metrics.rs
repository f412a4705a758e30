// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{IntCounterVec, IntGaugeVec, Opts};

pub use prometheus::Registry;

pub const METRICS_PREFIX: &str = "llamero_gateway";

/// Label values of the `outcome` label on sync counters
pub mod outcome {
    pub const HEALTHY: &str = "healthy";
    pub const UNHEALTHY: &str = "unhealthy";
    pub const ERROR: &str = "error";
}

pub struct Metrics {
    request_counter: IntCounterVec,
    inflight_gauge: IntGaugeVec,
    sync_counter: IntCounterVec,
    backend_healthy: IntGaugeVec,
    backend_latency: IntGaugeVec,
}

/// Requests are counted by the family of endpoint hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// OpenAI chat completions
    ChatCompletions,

    /// OpenAI completions
    Completions,

    /// OpenAI embeddings
    Embeddings,

    /// Calls forwarded to one backend's native API
    BackendAdmin,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "chat_completions",
            Endpoint::Completions => "completions",
            Endpoint::Embeddings => "embeddings",
            Endpoint::BackendAdmin => "backend_admin",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RAII object for the inflight gauge and request counter.
/// Dropped without [`InflightGuard::mark_status`], the request is counted as `error`.
pub struct InflightGuard {
    metrics: Arc<Metrics>,
    endpoint: Endpoint,
    status: String,
}

impl Metrics {
    /// Metrics created, all prefixed with [`METRICS_PREFIX`]:
    /// - `_requests_total{endpoint,status}` proxied requests by upstream status class
    /// - `_inflight_requests{endpoint}` requests whose response has not finished streaming
    /// - `_backend_syncs_total{outcome}` probe results of the sync engine
    /// - `_backend_healthy{backend}` 1 when the last probe succeeded
    /// - `_backend_latency_ms{backend}` duration of the last probe
    pub fn new() -> Result<Self, prometheus::Error> {
        let name = |suffix: &str| format!("{METRICS_PREFIX}_{suffix}");

        let request_counter = IntCounterVec::new(
            Opts::new(name("requests_total"), "Total number of proxied requests"),
            &["endpoint", "status"],
        )?;
        let inflight_gauge = IntGaugeVec::new(
            Opts::new(name("inflight_requests"), "Number of inflight requests"),
            &["endpoint"],
        )?;
        let sync_counter = IntCounterVec::new(
            Opts::new(name("backend_syncs_total"), "Backend syncs by outcome"),
            &["outcome"],
        )?;
        let backend_healthy = IntGaugeVec::new(
            Opts::new(name("backend_healthy"), "1 if the backend answered its last probe"),
            &["backend"],
        )?;
        let backend_latency = IntGaugeVec::new(
            Opts::new(name("backend_latency_ms"), "Duration of the last probe in milliseconds"),
            &["backend"],
        )?;

        Ok(Metrics {
            request_counter,
            inflight_gauge,
            sync_counter,
            backend_healthy,
            backend_latency,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.request_counter.clone()))?;
        registry.register(Box::new(self.inflight_gauge.clone()))?;
        registry.register(Box::new(self.sync_counter.clone()))?;
        registry.register(Box::new(self.backend_healthy.clone()))?;
        registry.register(Box::new(self.backend_latency.clone()))?;
        Ok(())
    }

    /// Create a guard that counts one request against `endpoint`
    pub fn create_inflight_guard(self: &Arc<Self>, endpoint: Endpoint) -> InflightGuard {
        self.inflight_gauge
            .with_label_values(&[endpoint.as_str()])
            .inc();
        InflightGuard {
            metrics: self.clone(),
            endpoint,
            status: "error".to_string(),
        }
    }

    pub fn get_request_counter(&self, endpoint: Endpoint, status: &str) -> u64 {
        self.request_counter
            .with_label_values(&[endpoint.as_str(), status])
            .get()
    }

    pub fn get_inflight_count(&self, endpoint: Endpoint) -> i64 {
        self.inflight_gauge
            .with_label_values(&[endpoint.as_str()])
            .get()
    }

    pub fn record_sync(&self, backend: &str, healthy: bool, latency_ms: u64) {
        let result = if healthy {
            outcome::HEALTHY
        } else {
            outcome::UNHEALTHY
        };
        self.sync_counter.with_label_values(&[result]).inc();
        self.backend_healthy
            .with_label_values(&[backend])
            .set(healthy as i64);
        self.backend_latency
            .with_label_values(&[backend])
            .set(i64::try_from(latency_ms).unwrap_or(i64::MAX));
    }

    pub fn record_sync_error(&self) {
        self.sync_counter.with_label_values(&[outcome::ERROR]).inc();
    }

    pub fn get_sync_count(&self, result: &str) -> u64 {
        self.sync_counter.with_label_values(&[result]).get()
    }

    /// Drop the per-backend series of a backend that is no longer registered
    pub fn forget_backend(&self, backend: &str) {
        let _ = self.backend_healthy.remove_label_values(&[backend]);
        let _ = self.backend_latency.remove_label_values(&[backend]);
    }
}

impl InflightGuard {
    /// Label the request with the status class of the upstream answer, e.g. `2xx`.
    pub fn mark_status(&mut self, status: axum::http::StatusCode) {
        self.status = format!("{}xx", status.as_u16() / 100);
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let endpoint = self.endpoint.as_str();
        self.metrics
            .inflight_gauge
            .with_label_values(&[endpoint])
            .dec();
        self.metrics
            .request_counter
            .with_label_values(&[endpoint, self.status.as_str()])
            .inc();
    }
}
