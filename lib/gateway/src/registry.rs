// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Persistent per-backend state.
//!
//! Each backend is one JSON record in the `backends` bucket holding both the
//! state and its ordering score, so a record is written or removed in a single
//! store operation. Updates are read-modify-write per id without cross-call
//! locking: two concurrent writers of the same id may lose one update.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use llamero_runtime::storage::key_value_store::{Key, KeyValueStoreManager, StoreError};

use crate::config::BackendDefinition;

pub const BACKENDS_BUCKET: &str = "backends";

/// Every write uses the same score, so `list` order falls back to the id.
pub const DEFAULT_ORDERING_SCORE: f64 = 0.0;

/// Weight tier filled from [`BackendDefinition::weight`]
pub const DEFAULT_WEIGHT_TIER: &str = "default";

/// Metadata about one model as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owned_by: String,
}

/// Cached knowledge about one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendState {
    pub id: String,
    pub address: String,
    pub healthy: bool,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Installed on disk
    #[serde(default)]
    pub models: Vec<String>,
    /// Currently resident in memory
    #[serde(default)]
    pub loaded_models: Vec<String>,
    #[serde(default)]
    pub model_meta: Vec<ModelInfo>,
    #[serde(default)]
    pub weights: BTreeMap<String, i64>,
    pub updated_at: DateTime<Utc>,
}

impl BackendState {
    /// A freshly registered backend: assumed healthy until a probe says otherwise.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        BackendState {
            id: id.into(),
            address: address.into(),
            healthy: true,
            latency_ms: 0,
            tags: vec![],
            models: vec![],
            loaded_models: vec![],
            model_meta: vec![],
            weights: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn has_address(&self) -> bool {
        !self.address.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryRecord {
    score: f64,
    state: BackendState,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("backend definition missing id or address")]
    MissingField,

    #[error("duplicate backend id {0:?}")]
    DuplicateId(String),

    #[error("backend address {address:?} reused by {first} and {second}")]
    DuplicateAddress {
        address: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("backend {0:?} not found")]
    NotFound(String),

    #[error("registry store error: {0}")]
    Store(#[from] StoreError),
}

/// Two addresses naming the same server compare equal.
fn address_key(address: &str) -> String {
    address.trim().trim_end_matches('/').to_string()
}

/// Reject blank fields and duplicate ids or addresses, in any order of appearance.
pub fn validate_definitions(defs: &[BackendDefinition]) -> Result<(), ConfigError> {
    let mut ids = HashSet::with_capacity(defs.len());
    let mut addresses: HashMap<String, &str> = HashMap::with_capacity(defs.len());
    for def in defs {
        let id = def.id.trim();
        let address = address_key(&def.address);
        if id.is_empty() || address.is_empty() {
            return Err(ConfigError::MissingField);
        }
        if !ids.insert(id) {
            return Err(ConfigError::DuplicateId(id.to_string()));
        }
        if let Some(first) = addresses.get(&address) {
            return Err(ConfigError::DuplicateAddress {
                address,
                first: first.to_string(),
                second: id.to_string(),
            });
        }
        addresses.insert(address, id);
    }
    Ok(())
}

/// Store-backed registry of [`BackendState`]s, keyed by backend id.
#[derive(Clone, Debug)]
pub struct BackendRegistry {
    store: KeyValueStoreManager,
}

impl BackendRegistry {
    pub fn new(store: KeyValueStoreManager) -> Self {
        BackendRegistry { store }
    }

    pub fn store(&self) -> &KeyValueStoreManager {
        &self.store
    }

    /// Make the registered id set equal the definitions.
    ///
    /// Nothing is written when validation fails. Existing backends keep their
    /// health and model fields; address, tags and weights are replaced.
    /// Returns the ids that were removed.
    pub async fn reconcile(&self, defs: &[BackendDefinition]) -> Result<Vec<String>, RegistryError> {
        validate_definitions(defs)?;

        let mut existing: HashMap<String, BackendState> = self
            .list()
            .await?
            .into_iter()
            .map(|state| (state.id.clone(), state))
            .collect();

        let now = Utc::now();
        for def in defs {
            let id = def.id.trim();

            let mut state = match existing.remove(id) {
                Some(prev) => prev,
                None => {
                    tracing::info!(backend = id, address = %def.address.trim(), "Registering backend");
                    BackendState::new(id, "")
                }
            };
            state.address = def.address.trim().to_string();
            state.tags = def.tags.clone();
            state.weights = BTreeMap::from([(DEFAULT_WEIGHT_TIER.to_string(), def.weight)]);
            state.updated_at = now;
            self.save(&state, DEFAULT_ORDERING_SCORE).await?;
        }

        // whatever was not claimed by a definition is stale
        let mut removed: Vec<String> = existing.into_keys().collect();
        removed.sort();
        for id in &removed {
            tracing::info!(backend = %id, "Removing backend no longer configured");
            self.delete(id).await?;
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> Result<BackendState, RegistryError> {
        self.store
            .load::<RegistryRecord>(BACKENDS_BUCKET, &Key::from(id))
            .await?
            .map(|record| record.state)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// All backends ordered by score, ties broken by id.
    pub async fn list(&self) -> Result<Vec<BackendState>, RegistryError> {
        let mut records: Vec<RegistryRecord> = self
            .store
            .list::<RegistryRecord>(BACKENDS_BUCKET)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        records.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.state.id.cmp(&b.state.id))
        });
        Ok(records.into_iter().map(|record| record.state).collect())
    }

    /// Persist state and ordering score as one record.
    pub async fn save(&self, state: &BackendState, score: f64) -> Result<(), RegistryError> {
        let record = RegistryRecord {
            score,
            state: state.clone(),
        };
        self.store
            .save(BACKENDS_BUCKET, &Key::from(state.id.as_str()), &record)
            .await?;
        Ok(())
    }

    /// Returns true if the backend was registered
    pub async fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        Ok(self.store.remove(BACKENDS_BUCKET, &Key::from(id)).await?)
    }
}
