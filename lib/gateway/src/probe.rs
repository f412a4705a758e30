// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Queries a backend's native API for what it can serve.
//!
//! Two calls, each with its own timeout:
//! - `GET {address}/api/tags` lists installed models and is required
//! - `GET {address}/api/ps` lists loaded models; a failure here only empties the loaded set
//!
//! Results are combined by [`combine`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::registry::ModelInfo;

/// Owner recorded when the backend does not name one.
pub const DEFAULT_MODEL_OWNER: &str = "library";

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid backend address {0:?}")]
    InvalidAddress(String),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// What a backend reported. All lists sorted and free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub installed: Vec<String>,
    pub loaded: Vec<String>,
    pub meta: Vec<ModelInfo>,
}

/// Entry of `/api/tags`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagModel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub remote_host: Option<String>,
}

/// Entry of `/api/ps`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunningModel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// `models` may be missing or `null` when a backend has none
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ModelsResponse<T> {
    #[serde(default)]
    models: Option<Vec<T>>,
}

impl<T> ModelsResponse<T> {
    fn into_models(self) -> Vec<T> {
        self.models.unwrap_or_default()
    }
}

#[async_trait]
pub trait ModelProbe: Send + Sync {
    async fn probe(&self, address: &str) -> Result<ProbeReport, ProbeError>;
}

/// [`ModelProbe`] speaking the Ollama HTTP API.
#[derive(Clone, Debug)]
pub struct BackendProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for BackendProbe {
    fn default() -> Self {
        BackendProbe::new(reqwest::Client::new(), DEFAULT_PROBE_TIMEOUT)
    }
}

impl BackendProbe {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        BackendProbe { client, timeout }
    }

    pub async fn list_installed(&self, address: &str) -> Result<Vec<TagModel>, ProbeError> {
        self.fetch_models(address, "/api/tags").await
    }

    pub async fn list_loaded(&self, address: &str) -> Result<Vec<RunningModel>, ProbeError> {
        self.fetch_models(address, "/api/ps").await
    }

    async fn fetch_models<T: for<'de> Deserialize<'de>>(
        &self,
        address: &str,
        path: &str,
    ) -> Result<Vec<T>, ProbeError> {
        let url = native_url(address, path)?;
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| ProbeError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status {
                url: url.to_string(),
                status,
            });
        }
        let body: ModelsResponse<T> =
            response.json().await.map_err(|source| ProbeError::Decode {
                url: url.to_string(),
                source,
            })?;
        Ok(body.into_models())
    }
}

#[async_trait]
impl ModelProbe for BackendProbe {
    async fn probe(&self, address: &str) -> Result<ProbeReport, ProbeError> {
        let (installed, loaded) =
            tokio::join!(self.list_installed(address), self.list_loaded(address));
        let installed = installed?;
        let loaded = loaded.unwrap_or_else(|err| {
            tracing::debug!(address, %err, "Loaded models unavailable, treating as none");
            Vec::new()
        });
        Ok(combine(installed, loaded))
    }
}

fn native_url(address: &str, path: &str) -> Result<reqwest::Url, ProbeError> {
    let base = address.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(ProbeError::InvalidAddress(address.to_string()));
    }
    reqwest::Url::parse(&format!("{base}{path}"))
        .map_err(|_| ProbeError::InvalidAddress(address.to_string()))
}

/// First non-blank candidate
fn model_name(name: &str, model: &str) -> Option<String> {
    [name, model]
        .into_iter()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// RFC 3339 timestamps at or before the unix epoch count as unknown.
fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let ts = DateTime::parse_from_rfc3339(raw?.trim()).ok()?;
    let ts = ts.with_timezone(&Utc);
    (ts.timestamp() > 0).then_some(ts)
}

fn merge_meta(
    meta: &mut BTreeMap<String, ModelInfo>,
    name: &str,
    created_at: Option<DateTime<Utc>>,
    owner: Option<&str>,
) {
    let owner = owner.map(str::trim).filter(|o| !o.is_empty());
    let entry = meta.entry(name.to_string()).or_insert_with(|| ModelInfo {
        name: name.to_string(),
        created_at: None,
        owned_by: DEFAULT_MODEL_OWNER.to_string(),
    });
    entry.created_at = match (entry.created_at, created_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    match owner {
        Some(owner) if entry.owned_by == DEFAULT_MODEL_OWNER => entry.owned_by = owner.to_string(),
        _ => {}
    }
}

/// Combine the two listings into a report.
///
/// Names fall back from `name` to `model`. Per name the earliest known
/// timestamp wins and an explicit owner beats [`DEFAULT_MODEL_OWNER`].
pub fn combine(installed: Vec<TagModel>, loaded: Vec<RunningModel>) -> ProbeReport {
    let mut meta = BTreeMap::new();
    let mut installed_names = BTreeSet::new();
    let mut loaded_names = BTreeSet::new();

    for m in &installed {
        let Some(name) = model_name(&m.name, &m.model) else {
            continue;
        };
        merge_meta(
            &mut meta,
            &name,
            parse_timestamp(m.modified_at.as_deref()),
            m.remote_host.as_deref(),
        );
        installed_names.insert(name);
    }

    for m in &loaded {
        let Some(name) = model_name(&m.name, &m.model) else {
            continue;
        };
        merge_meta(&mut meta, &name, parse_timestamp(m.expires_at.as_deref()), None);
        loaded_names.insert(name);
    }

    ProbeReport {
        installed: installed_names.into_iter().collect(),
        loaded: loaded_names.into_iter().collect(),
        meta: meta.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tag(name: &str, model: &str, modified_at: Option<&str>, remote: Option<&str>) -> TagModel {
        TagModel {
            name: name.into(),
            model: model.into(),
            modified_at: modified_at.map(Into::into),
            remote_host: remote.map(Into::into),
        }
    }

    fn running(name: &str, expires_at: Option<&str>) -> RunningModel {
        RunningModel {
            name: name.into(),
            model: String::new(),
            expires_at: expires_at.map(Into::into),
        }
    }

    #[test]
    fn test_combine_sorts_and_dedups() {
        let report = combine(
            vec![
                tag("qwen2", "", None, None),
                tag("llama3", "", None, None),
                tag("qwen2", "", None, None),
                tag("", "mistral", None, None),
                tag("  ", "", None, None),
            ],
            vec![running("qwen2", None), running("llama3", None), running("qwen2", None)],
        );
        assert_eq!(report.installed, vec!["llama3", "mistral", "qwen2"]);
        assert_eq!(report.loaded, vec!["llama3", "qwen2"]);
        let names: Vec<_> = report.meta.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["llama3", "mistral", "qwen2"]);
    }

    #[test]
    fn test_combine_keeps_earliest_timestamp_and_explicit_owner() {
        let report = combine(
            vec![tag(
                "llama3",
                "",
                Some("2024-05-01T10:00:00Z"),
                Some("registry.example.com"),
            )],
            vec![running("llama3", Some("2024-01-01T00:00:00+02:00"))],
        );
        let meta = &report.meta[0];
        assert_eq!(
            meta.created_at,
            Some("2023-12-31T22:00:00Z".parse::<DateTime<Utc>>().expect("ts"))
        );
        assert_eq!(meta.owned_by, "registry.example.com");
    }

    #[test]
    fn test_loaded_only_model_gets_default_owner() {
        let report = combine(vec![], vec![running("phi3", Some("2024-03-01T00:00:00Z"))]);
        assert!(report.installed.is_empty());
        assert_eq!(report.loaded, vec!["phi3"]);
        assert_eq!(report.meta[0].owned_by, DEFAULT_MODEL_OWNER);
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some("0001-01-01T00:00:00Z"), None)]
    #[case(Some("not a date"), None)]
    #[case(Some("1970-01-01T00:00:00Z"), None)]
    #[case(Some("2024-06-01T12:00:00.123456789-07:00"), Some(1717268400))]
    fn test_parse_timestamp(#[case] raw: Option<&str>, #[case] expected: Option<i64>) {
        assert_eq!(parse_timestamp(raw).map(|ts| ts.timestamp()), expected);
    }

    #[rstest]
    #[case(r#"{"models":null}"#, 0)]
    #[case(r#"{}"#, 0)]
    #[case(r#"{"models":[{"name":"llama3"}]}"#, 1)]
    fn test_models_response_tolerates_null(#[case] raw: &str, #[case] expected: usize) {
        let body: ModelsResponse<TagModel> = serde_json::from_str(raw).expect("decode");
        assert_eq!(body.into_models().len(), expected);
    }

    #[tokio::test]
    async fn test_probe_backend_without_models_is_healthy() -> anyhow::Result<()> {
        use axum::{Json, Router, routing::get};

        let app = Router::new()
            .route("/api/tags", get(|| async { Json(serde_json::json!({ "models": null })) }))
            .route("/api/ps", get(|| async { Json(serde_json::json!({ "models": null })) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = format!("http://{}", listener.local_addr()?);
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let report = BackendProbe::default().probe(&address).await?;
        assert_eq!(report, ProbeReport::default());

        server.abort();
        Ok(())
    }

    #[rstest]
    #[case("http://gpu-a:11434", "http://gpu-a:11434/api/tags")]
    #[case(" http://gpu-a:11434/ ", "http://gpu-a:11434/api/tags")]
    fn test_native_url(#[case] address: &str, #[case] expected: &str) {
        assert_eq!(
            native_url(address, "/api/tags").expect("valid").as_str(),
            expected
        );
    }

    #[test]
    fn test_native_url_rejects_garbage() {
        assert!(native_url("", "/api/tags").is_err());
        assert!(native_url("not a url", "/api/tags").is_err());
    }
}
