// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Picks the backend that serves a request. Pure functions over a registry snapshot.

use axum::http::StatusCode;

use crate::registry::BackendState;

/// Where to send a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    pub address: String,
}

impl From<&BackendState> for Route {
    fn from(state: &BackendState) -> Self {
        Route {
            id: state.id.clone(),
            address: state.address.trim().to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no healthy backends available")]
    NoHealthyBackends,

    #[error("backend not found")]
    NotFound,

    #[error("backend missing address")]
    MissingAddress,
}

impl RoutingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoutingError::NoHealthyBackends => StatusCode::SERVICE_UNAVAILABLE,
            RoutingError::NotFound => StatusCode::NOT_FOUND,
            RoutingError::MissingAddress => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Prefer a backend with `model` loaded, then one with it installed, then any
/// healthy backend. Order within each tier follows the snapshot.
pub fn select_for_model(states: &[BackendState], model: &str) -> Result<Route, RoutingError> {
    let model = model.trim();
    let mut healthy = states.iter().filter(|s| s.healthy && s.has_address());
    let first = healthy.clone().next().ok_or(RoutingError::NoHealthyBackends)?;
    if model.is_empty() {
        return Ok(first.into());
    }

    let mut installed = None;
    for state in &mut healthy {
        if state.loaded_models.iter().any(|m| m == model) {
            return Ok(state.into());
        }
        if installed.is_none() && state.models.iter().any(|m| m == model) {
            installed = Some(state);
        }
    }
    Ok(installed.unwrap_or(first).into())
}

/// Route to one named backend regardless of health.
pub fn select_by_id(states: &[BackendState], id: &str) -> Result<Route, RoutingError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(RoutingError::NotFound);
    }
    let state = states
        .iter()
        .find(|s| s.id == id)
        .ok_or(RoutingError::NotFound)?;
    if !state.has_address() {
        return Err(RoutingError::MissingAddress);
    }
    Ok(state.into())
}
