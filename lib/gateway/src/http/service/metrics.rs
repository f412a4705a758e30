// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::Encoder as _;

use super::RouteDoc;
use super::error::HttpError;
use crate::metrics::Registry;

/// Create an axum [`Router`] serving the Prometheus text exposition of `registry`.
/// Defaults to `/metrics` when `path` is `None`.
pub fn router(registry: Registry, path: Option<String>) -> (Vec<RouteDoc>, Router) {
    let registry = Arc::new(registry);
    let path = path.unwrap_or_else(|| "/metrics".to_string());
    let doc = RouteDoc::new(axum::http::Method::GET, &path);
    let route = Router::new()
        .route(&path, get(handler_metrics))
        .with_state(registry);
    (vec![doc], route)
}

/// Metrics Handler
async fn handler_metrics(State(registry): State<Arc<Registry>>) -> Response {
    match encode(&registry) {
        Ok(metrics) => (StatusCode::OK, metrics).into_response(),
        Err(err) => err.into_response(),
    }
}

fn encode(registry: &Registry) -> Result<String, HttpError> {
    let failed = |err: &dyn std::fmt::Display| {
        tracing::error!(%err, "Failed to encode metrics");
        HttpError::internal("failed to encode metrics")
    };
    let mut buffer = vec![];
    prometheus::TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|err| failed(&err))?;
    String::from_utf8(buffer).map_err(|err| failed(&err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    #[tokio::test]
    async fn test_handler_serves_text_exposition() {
        let registry = Registry::new();
        let metrics = Metrics::new().expect("metrics");
        metrics.register(&registry).expect("register");
        metrics.record_sync("gpu-a", true, 7);

        let response = handler_metrics(State(Arc::new(registry))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("llamero_gateway_backend_latency_ms{backend=\"gpu-a\"} 7"));
    }
}
