// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{Router, extract::Request, http::Method, response::Response, routing::post};

use super::{RouteDoc, State, proxy, with_scopes};
use crate::auth::scopes;
use crate::metrics::Endpoint;

/// Prefixes each OpenAI route is served under
const PREFIXES: &[&str] = &["/api", "/v1"];

/// OpenAI compatible inference routes, routed to a backend by model
pub fn router(state: Arc<State>) -> (Vec<RouteDoc>, Router) {
    let mut docs = Vec::new();
    let mut router = Router::new();
    for prefix in PREFIXES {
        let chat = format!("{prefix}/chat/completions");
        let completions = format!("{prefix}/completions");
        let embeddings = format!("{prefix}/embeddings");
        docs.push(RouteDoc::new(Method::POST, &chat));
        docs.push(RouteDoc::new(Method::POST, &completions));
        docs.push(RouteDoc::new(Method::POST, &embeddings));
        router = router
            .route(&chat, post(chat_completions))
            .route(&completions, post(completions_handler))
            .route(&embeddings, post(embeddings_handler));
    }
    let router = with_scopes(router.with_state(state.clone()), &state, &[scopes::LLM_CHAT]);
    (docs, router)
}

async fn chat_completions(
    axum::extract::State(state): axum::extract::State<Arc<State>>,
    request: Request,
) -> Response {
    proxy::dispatch_inference(state, Endpoint::ChatCompletions, request).await
}

async fn completions_handler(
    axum::extract::State(state): axum::extract::State<Arc<State>>,
    request: Request,
) -> Response {
    proxy::dispatch_inference(state, Endpoint::Completions, request).await
}

async fn embeddings_handler(
    axum::extract::State(state): axum::extract::State<Arc<State>>,
    request: Request,
) -> Response {
    proxy::dispatch_inference(state, Endpoint::Embeddings, request).await
}
