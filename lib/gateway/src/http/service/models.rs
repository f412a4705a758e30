// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{Json, Router, extract::Path, http::Method, routing::get};
use chrono::Utc;

use super::error::HttpError;
use super::{RouteDoc, State, with_scopes};
use crate::auth::scopes;
use crate::catalog::{self, ModelCatalogEntry, ModelList};
use crate::registry::BackendState;

/// Model catalog merged across all backends, under `/api/models` and `/v1/models`.
/// Model ids may contain `/`, so the single-model route takes the rest of the path.
pub fn router(state: Arc<State>) -> (Vec<RouteDoc>, Router) {
    let mut docs = Vec::new();
    let mut router = Router::new();
    for base in ["/api/models", "/v1/models"] {
        let one = format!("{base}/{{*id}}");
        docs.push(RouteDoc::new(Method::GET, base));
        docs.push(RouteDoc::new(Method::GET, &one));
        router = router
            .route(base, get(list_models))
            .route(&one, get(get_model));
    }
    let router = with_scopes(router.with_state(state.clone()), &state, &[scopes::MODELS_READ]);
    (docs, router)
}

async fn backend_states(state: &State) -> Result<Vec<BackendState>, HttpError> {
    state.registry().list().await.map_err(|err| {
        tracing::error!(%err, "Failed listing backends for catalog");
        HttpError::internal("failed to list models")
    })
}

async fn list_models(
    axum::extract::State(state): axum::extract::State<Arc<State>>,
) -> Result<Json<ModelList>, HttpError> {
    let states = backend_states(&state).await?;
    Ok(Json(catalog::merge_catalog(&states, Utc::now())))
}

async fn get_model(
    axum::extract::State(state): axum::extract::State<Arc<State>>,
    Path(id): Path<String>,
) -> Result<Json<ModelCatalogEntry>, HttpError> {
    let id = id.trim_start_matches('/');
    let states = backend_states(&state).await?;
    catalog::find_model(&states, id, Utc::now())
        .map(Json)
        .ok_or_else(|| HttpError::not_found("model not found"))
}
