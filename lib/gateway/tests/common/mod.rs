// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

//! A fake Ollama backend served on a random local port, and a task recorder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use llamero_gateway::tasks::{QueueError, SyncTask, TaskEnqueuer};

/// One request as seen by the fake backend
#[derive(Debug, Clone)]
pub struct Seen {
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Default)]
pub struct Calls {
    count: AtomicUsize,
    seen: Mutex<Vec<Seen>>,
}

impl Calls {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Seen> {
        self.seen.lock().last().cloned()
    }

    fn record(&self, uri: &Uri, headers: &HeaderMap, body: Bytes) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(Seen {
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers: headers.clone(),
            body,
        });
    }
}

/// What the fake reports from `/api/tags` and `/api/ps`
#[derive(Clone, Default)]
pub struct Inventory {
    pub installed: Vec<(&'static str, &'static str)>,
    pub loaded: Vec<&'static str>,
}

struct FakeState {
    name: String,
    inventory: Inventory,
    calls: Arc<Calls>,
}

pub struct FakeBackend {
    pub address: String,
    pub calls: Arc<Calls>,
    cancel: CancellationToken,
}

impl FakeBackend {
    /// Installed models are `(name, modified_at)` pairs.
    pub async fn start(name: &str, inventory: Inventory) -> FakeBackend {
        let calls = Arc::new(Calls::default());
        let state = Arc::new(FakeState {
            name: name.to_string(),
            inventory,
            calls: calls.clone(),
        });
        let router = Router::new()
            .route("/api/tags", get(tags))
            .route("/api/ps", get(ps))
            .route("/api/version", get(version))
            .route("/api/pull", post(pull))
            .route("/api/show", post(show))
            .route("/api/delete", delete(delete_model))
            .route("/v1/chat/completions", post(echo))
            .route("/v1/completions", post(echo))
            .route("/v1/embeddings", post(echo))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr: SocketAddr = listener.local_addr().expect("local addr");
        let cancel = CancellationToken::new();
        let observer = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(observer.cancelled_owned())
                .await
                .expect("fake backend");
        });

        FakeBackend {
            address: format!("http://{addr}"),
            calls,
            cancel,
        }
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn tags(State(state): State<Arc<FakeState>>, uri: Uri, headers: HeaderMap) -> Response {
    state.calls.record(&uri, &headers, Bytes::new());
    let models: Vec<_> = state
        .inventory
        .installed
        .iter()
        .map(|(name, modified_at)| json!({"name": name, "model": name, "modified_at": modified_at}))
        .collect();
    Json(json!({ "models": models })).into_response()
}

async fn ps(State(state): State<Arc<FakeState>>, uri: Uri, headers: HeaderMap) -> Response {
    state.calls.record(&uri, &headers, Bytes::new());
    let models: Vec<_> = state
        .inventory
        .loaded
        .iter()
        .map(|name| json!({"name": name, "model": name}))
        .collect();
    Json(json!({ "models": models })).into_response()
}

async fn version(State(state): State<Arc<FakeState>>, uri: Uri, headers: HeaderMap) -> Response {
    state.calls.record(&uri, &headers, Bytes::new());
    Json(json!({"version": "0.6.2"})).into_response()
}

async fn pull(
    State(state): State<Arc<FakeState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.record(&uri, &headers, body);
    (
        [("x-backend", state.name.clone())],
        Json(json!({"status": "success"})),
    )
        .into_response()
}

async fn show(
    State(state): State<Arc<FakeState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.record(&uri, &headers, body);
    Json(json!({"modelfile": "FROM llama3"})).into_response()
}

async fn delete_model(
    State(state): State<Arc<FakeState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.record(&uri, &headers, body);
    (StatusCode::NOT_FOUND, Json(json!({"error": "model not found"}))).into_response()
}

async fn echo(
    State(state): State<Arc<FakeState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.record(&uri, &headers, body);
    (
        [("x-backend", state.name.clone()), ("connection", "close".to_string())],
        Json(json!({"backend": state.name, "path": uri.path()})),
    )
        .into_response()
}

/// Enqueuer that keeps tasks in memory
#[derive(Default)]
pub struct Recorder {
    tasks: Mutex<Vec<SyncTask>>,
}

impl Recorder {
    pub fn tasks(&self) -> Vec<SyncTask> {
        self.tasks.lock().clone()
    }

    /// Wait briefly for spawned enqueues to land
    pub async fn wait_for(&self, count: usize) -> Vec<SyncTask> {
        for _ in 0..100 {
            if self.tasks.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.tasks()
    }
}

#[async_trait]
impl TaskEnqueuer for Recorder {
    async fn enqueue(&self, task: SyncTask) -> Result<String, QueueError> {
        let mut tasks = self.tasks.lock();
        tasks.push(task);
        Ok(tasks.len().to_string())
    }
}

/// Header map lookup as a string, for assertions
pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
