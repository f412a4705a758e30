// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Gateway configuration.
//!
//! Layers, lowest precedence first:
//! 1. built-in defaults
//! 2. TOML file (explicit path or `LLAMERO_CONFIG`)
//! 3. `LLAMERO_` environment variables, nested with `__`
//!    (e.g. `LLAMERO_SERVER__PORT=9000`, `LLAMERO_WORKER__CONCURRENCY=8`)
//!
//! Backend definitions come from `[[backends]]` in the main file and, when
//! `backends_file` is set, from the `[[backends]]` array of that file as well.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use figment::{
    Figment,
    providers::{Env, Format as _, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use llamero_runtime::config::environment_names::gateway as env_gateway;
use llamero_runtime::config::humantime_serde;
use llamero_runtime::storage::key_value_store::Selector;

/// Default cap on request bodies read by the proxy.
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 << 20;

fn validate_non_zero(d: &Duration) -> Result<(), ValidationError> {
    if d.is_zero() {
        return Err(ValidationError::new("duration_zero"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct GatewayConfig {
    #[validate(nested)]
    #[serde(default)]
    pub server: ServerConfig,

    /// `mem` or `file:<dir>`
    #[serde(default)]
    pub store: Selector,

    #[validate(nested)]
    #[serde(default)]
    pub probe: ProbeConfig,

    #[validate(nested)]
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub backends: Vec<BackendDefinition>,

    /// Extra TOML file holding a `[[backends]]` array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    /// Largest request body the proxy will read
    #[validate(range(min = 1))]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProbeConfig {
    /// Applied to each native API call separately
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    /// How often a full sync is enqueued
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WorkerConfig {
    /// Tasks handled at the same time by one process
    #[validate(range(min = 1, max = 256))]
    pub concurrency: usize,

    /// Upper bound on the wait between queue scans when nothing wakes the worker
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub poll_interval: Duration,

    /// Attempts before a failing task is dropped
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub retry_backoff: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub max_backoff: Duration,

    /// A claim older than this is considered abandoned by a dead worker
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub lease_ttl: Duration,

    /// How long shutdown waits for in-flight tasks
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            max_attempts: 5,
            retry_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Bearer tokens accepted by the gateway. Empty disables authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<StaticToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub subject: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// One configured inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDefinition {
    pub id: String,
    /// Base URL, e.g. `http://gpu-a:11434`
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    1
}

impl BackendDefinition {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        BackendDefinition {
            id: id.into(),
            address: address.into(),
            tags: vec![],
            weight: default_weight(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BackendsFile {
    #[serde(default)]
    backends: Vec<BackendDefinition>,
}

impl GatewayConfig {
    /// Load from defaults, an optional TOML file and the environment, then validate.
    /// Without an explicit path `LLAMERO_CONFIG` is consulted.
    pub fn load(path: Option<&Path>) -> anyhow::Result<GatewayConfig> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(env_gateway::LLAMERO_CONFIG).map(PathBuf::from));
        if let Some(path) = path.as_deref().filter(|p| !p.is_file()) {
            anyhow::bail!("Config file {} not found", path.display());
        }
        Self::figment(path.as_deref())
            .extract::<GatewayConfig>()
            .context("Invalid gateway configuration")?
            .finish()
    }

    /// Validate and pull in `backends_file`.
    pub fn finish(mut self) -> anyhow::Result<GatewayConfig> {
        self.validate()?;
        if let Some(file) = &self.backends_file {
            if !file.is_file() {
                anyhow::bail!("Backends file {} not found", file.display());
            }
            let extra: BackendsFile = Figment::from(Toml::file(file))
                .extract()
                .with_context(|| format!("Reading backends from {}", file.display()))?;
            self.backends.extend(extra.backends);
        }
        Ok(self)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(env_gateway::LLAMERO_ENV_PREFIX).split("__"))
    }

    /// `host:port` the HTTP service binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
