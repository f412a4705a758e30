// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP front door of the gateway.
//!
//! Routes:
//! - `/api/backends` and `/api/backends/{id}/...` backend listing and native admin calls
//! - `/api/chat/completions`, `/api/completions`, `/api/embeddings` and `/v1` aliases
//! - `/api/models`, `/api/models/{id}` and `/v1` aliases
//! - `/healthz`, `/live`, `/metrics`

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::http::Method;
use derive_builder::Builder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use llamero_runtime::logging::make_request_span;

use crate::auth::{Authenticator, RequireScopes, require_scopes};
use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::metrics::{Metrics, Registry};
use crate::registry::BackendRegistry;
use crate::tasks::TaskEnqueuer;

pub mod backends;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod openai;
pub mod proxy;

/// Documentation of one route, for startup logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDoc {
    method: Method,
    path: String,
}

impl RouteDoc {
    pub fn new<T: Into<String>>(method: Method, path: T) -> Self {
        RouteDoc {
            method,
            path: path.into(),
        }
    }
}

impl std::fmt::Display for RouteDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Shared with every request handler
pub struct State {
    registry: BackendRegistry,
    tasks: Option<Arc<dyn TaskEnqueuer>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
    max_body_bytes: usize,
}

impl State {
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Where follow-up syncs go. `None` disables them.
    pub fn tasks(&self) -> Option<&Arc<dyn TaskEnqueuer>> {
        self.tasks.as_ref()
    }

    /// Pooled client for all backend calls
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn metrics_clone(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Middleware state granting access to holders of `scopes`
    pub fn require(&self, scopes: &[&'static str]) -> RequireScopes {
        RequireScopes::new(self.authenticator.clone(), scopes)
    }
}

/// Apply the scope check of `scopes` to every route of `router`
pub(crate) fn with_scopes(router: Router, state: &State, scopes: &[&'static str]) -> Router {
    router.route_layer(axum::middleware::from_fn_with_state(
        state.require(scopes),
        require_scopes,
    ))
}

#[derive(Clone)]
pub struct HttpService {
    // The state we share with every request handler
    state: Arc<State>,

    router: Router,
    port: u16,
    host: String,
    route_docs: Vec<RouteDoc>,
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct HttpServiceConfig {
    #[builder(default = "8080")]
    port: u16,

    #[builder(setter(into), default = "String::from(\"0.0.0.0\")")]
    host: String,

    registry: BackendRegistry,

    #[builder(default = "None")]
    tasks: Option<Arc<dyn TaskEnqueuer>>,

    #[builder(default = "None")]
    authenticator: Option<Arc<dyn Authenticator>>,

    #[builder(default = "DEFAULT_MAX_BODY_BYTES")]
    max_body_bytes: usize,

    #[builder(default = "None")]
    client: Option<reqwest::Client>,
}

impl HttpService {
    pub fn builder() -> HttpServiceConfigBuilder {
        HttpServiceConfigBuilder::default()
    }

    pub fn state_clone(&self) -> Arc<State> {
        self.state.clone()
    }

    pub fn state(&self) -> &State {
        Arc::as_ref(&self.state)
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn route_docs(&self) -> &[RouteDoc] {
        &self.route_docs
    }

    pub async fn spawn(&self, cancel_token: CancellationToken) -> JoinHandle<Result<()>> {
        let this = self.clone();
        tokio::spawn(async move { this.run(cancel_token).await })
    }

    pub async fn run(&self, cancel_token: CancellationToken) -> Result<()> {
        let address = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|err| anyhow::anyhow!("Failed to bind to address {address}: {err}"))?;
        tracing::info!(address = %listener.local_addr()?, "Starting HTTP service");
        for doc in &self.route_docs {
            tracing::debug!(route = %doc, "Route registered");
        }

        let observer = cancel_token.child_token();
        axum::serve(
            listener,
            self.router
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(observer.cancelled_owned())
        .await
        .inspect_err(|_| cancel_token.cancel())?;

        Ok(())
    }
}

impl HttpServiceConfigBuilder {
    pub fn build(self) -> Result<HttpService> {
        let config: HttpServiceConfig = self.build_internal()?;

        let metrics = Arc::new(Metrics::new()?);
        let registry = Registry::new();
        metrics.register(&registry)?;

        let client = match config.client {
            Some(client) => client,
            None => reqwest::Client::builder().build()?,
        };

        let state = Arc::new(State {
            registry: config.registry,
            tasks: config.tasks,
            authenticator: config.authenticator,
            client,
            metrics,
            max_body_bytes: config.max_body_bytes,
        });

        let mut router = Router::new();
        let mut all_docs = Vec::new();
        let routes = vec![
            health::health_check_router(state.clone(), None),
            health::live_check_router(state.clone(), None),
            metrics::router(registry, None),
            openai::router(state.clone()),
            models::router(state.clone()),
            backends::router(state.clone()),
        ];
        for (route_docs, route) in routes {
            router = router.merge(route);
            all_docs.extend(route_docs);
        }
        let router = router.layer(TraceLayer::new_for_http().make_span_with(make_request_span));

        Ok(HttpService {
            state,
            router,
            port: config.port,
            host: config.host,
            route_docs: all_docs,
        })
    }

    pub fn with_tasks(mut self, tasks: Option<Arc<dyn TaskEnqueuer>>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_client(mut self, client: Option<reqwest::Client>) -> Self {
        self.client = Some(client);
        self
    }
}
