// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bearer-token authentication and per-route scope checks.
//!
//! Token verification sits behind [`Authenticator`]; the gateway ships a
//! static token table. Without an authenticator every request passes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::config::StaticToken;
use crate::http::service::error::HttpError;

pub mod scopes {
    pub const LLM_CHAT: &str = "llm:chat";
    pub const MODELS_READ: &str = "models:read";
    pub const BACKENDS_READ: &str = "backends:read";
    pub const BACKENDS_WRITE: &str = "backends:write";
}

pub const TOKEN_TYPE_STATIC: &str = "static";

/// Identity attached to an authenticated request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub subject: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_sub: Option<String>,
}

impl Claims {
    /// True when every required scope is granted
    pub fn has_scopes(&self, required: &[&str]) -> bool {
        let granted: HashSet<&str> = self.scopes.iter().map(String::as_str).collect();
        required.iter().all(|scope| granted.contains(scope))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("insufficient scope")]
    InsufficientScope,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientScope => StatusCode::FORBIDDEN,
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Tokens listed in configuration
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Claims>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: &[StaticToken]) -> Self {
        let tokens = tokens
            .iter()
            .filter(|t| !t.token.trim().is_empty())
            .map(|t| {
                let claims = Claims {
                    subject: t.subject.clone(),
                    role: t.role.clone(),
                    scopes: t.scopes.clone(),
                    token_type: TOKEN_TYPE_STATIC.to_string(),
                    external_sub: None,
                };
                (t.token.trim().to_string(), claims)
            })
            .collect();
        StaticTokenAuthenticator { tokens }
    }

    /// `None` when no token is configured, which leaves the gateway open.
    pub fn from_config(tokens: &[StaticToken]) -> Option<Arc<dyn Authenticator>> {
        let authenticator = Self::new(tokens);
        if authenticator.tokens.is_empty() {
            tracing::warn!("No API tokens configured, authentication disabled");
            return None;
        }
        Some(Arc::new(authenticator))
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// `Authorization: Bearer <token>`, scheme case-insensitive
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

/// State of the scope middleware installed on one group of routes
#[derive(Clone)]
pub struct RequireScopes {
    authenticator: Option<Arc<dyn Authenticator>>,
    required: Arc<[&'static str]>,
}

impl RequireScopes {
    pub fn new(authenticator: Option<Arc<dyn Authenticator>>, required: &[&'static str]) -> Self {
        RequireScopes {
            authenticator,
            required: required.into(),
        }
    }

    pub async fn check(&self, headers: &HeaderMap) -> Result<Option<Claims>, AuthError> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(None);
        };
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        let claims = authenticator.authenticate(token).await?;
        if !claims.has_scopes(&self.required) {
            return Err(AuthError::InsufficientScope);
        }
        Ok(Some(claims))
    }
}

/// Use with `axum::middleware::from_fn_with_state`. Authenticated claims are
/// available to handlers as an `Extension<Claims>`.
pub async fn require_scopes(
    State(auth): State<RequireScopes>,
    mut request: Request,
    next: Next,
) -> Response {
    match auth.check(request.headers()).await {
        Ok(Some(claims)) => {
            tracing::trace!(subject = %claims.subject, "Authenticated");
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(err) => HttpError::from(err).into_response(),
    }
}
