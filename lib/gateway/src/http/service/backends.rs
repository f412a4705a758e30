// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request},
    http::Method,
    routing::{MethodRouter, delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::HttpError;
use super::proxy::{self, AdminCall};
use super::{RouteDoc, State, with_scopes};
use crate::auth::scopes;
use crate::registry::BackendState;

/// Public view of a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendView {
    pub id: String,
    pub address: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub tags: Vec<String>,
    pub models: Vec<String>,
    pub loaded_models: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<BackendState> for BackendView {
    fn from(state: BackendState) -> Self {
        BackendView {
            id: state.id,
            address: state.address,
            healthy: state.healthy,
            latency_ms: state.latency_ms,
            tags: state.tags,
            models: state.models,
            loaded_models: state.loaded_models,
            updated_at: state.updated_at,
        }
    }
}

const BASE: &str = "/api/backends";

/// Backend listing plus native admin calls on one backend.
/// Reads need `backends:read`, calls that change a backend need `backends:write`.
pub fn router(state: Arc<State>) -> (Vec<RouteDoc>, Router) {
    let read_calls = [
        ("ps", AdminCall::Ps),
        ("version", AdminCall::Version),
        ("show", AdminCall::Show),
    ];
    let write_calls = [
        ("create", AdminCall::Create),
        ("copy", AdminCall::Copy),
        ("pull", AdminCall::Pull),
        ("push", AdminCall::Push),
        ("delete", AdminCall::Delete),
    ];

    let mut docs = vec![RouteDoc::new(Method::GET, BASE)];
    let mut read = Router::new().route(BASE, get(list_backends));
    for (name, call) in read_calls {
        let path = format!("{BASE}/{{id}}/{name}");
        docs.push(RouteDoc::new(call.method(), &path));
        read = read.route(&path, admin_route(call));
    }

    let mut write = Router::new();
    for (name, call) in write_calls {
        let path = format!("{BASE}/{{id}}/{name}");
        docs.push(RouteDoc::new(call.method(), &path));
        write = write.route(&path, admin_route(call));
    }

    let read = with_scopes(read.with_state(state.clone()), &state, &[scopes::BACKENDS_READ]);
    let write = with_scopes(write.with_state(state.clone()), &state, &[scopes::BACKENDS_WRITE]);
    (docs, read.merge(write))
}

fn admin_route(call: AdminCall) -> MethodRouter<Arc<State>> {
    let handler = move |axum::extract::State(state): axum::extract::State<Arc<State>>,
                        Path(id): Path<String>,
                        request: Request| async move {
        proxy::dispatch_admin(state, id, call, request).await
    };
    let method = call.method();
    if method == Method::GET {
        get(handler)
    } else if method == Method::DELETE {
        delete(handler)
    } else {
        post(handler)
    }
}

async fn list_backends(
    axum::extract::State(state): axum::extract::State<Arc<State>>,
) -> Result<Json<Vec<BackendView>>, HttpError> {
    let states = state.registry().list().await.map_err(|err| {
        tracing::error!(%err, "Failed listing backends");
        HttpError::internal("failed to list backends")
    })?;
    Ok(Json(states.into_iter().map(BackendView::from).collect()))
}
