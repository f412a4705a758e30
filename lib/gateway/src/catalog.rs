// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The global model catalog, recomputed from backend states on every read.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::DEFAULT_MODEL_OWNER;
use crate::registry::BackendState;

/// OpenAI style model object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub object: String,
    /// Unix seconds
    pub created: i64,
    pub owned_by: String,
}

/// OpenAI style list of models, sorted by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCatalogEntry>,
}

struct Candidate {
    created: i64,
    owned_by: String,
    explicit_owner: bool,
}

fn add_model(
    dest: &mut BTreeMap<String, Candidate>,
    name: &str,
    created: i64,
    owned_by: &str,
    explicit_owner: bool,
) {
    let name = name.trim();
    if name.is_empty() {
        return;
    }
    match dest.get_mut(name) {
        Some(existing) => {
            if created > 0 && (existing.created <= 0 || created < existing.created) {
                existing.created = created;
            }
            if explicit_owner && !existing.explicit_owner {
                existing.owned_by = owned_by.to_string();
                existing.explicit_owner = true;
            }
        }
        None => {
            dest.insert(
                name.to_string(),
                Candidate {
                    created,
                    owned_by: owned_by.to_string(),
                    explicit_owner,
                },
            );
        }
    }
}

/// Merge every backend's models into one list.
///
/// Per model the earliest creation time wins. The owner is the first explicit
/// metadata owner seen, else the id of the first backend reporting it. A
/// backend without metadata contributes its installed names stamped with its
/// own `updated_at`. `now` stands in for a creation time nobody knows.
pub fn merge_catalog(states: &[BackendState], now: DateTime<Utc>) -> ModelList {
    let mut models = BTreeMap::new();
    for state in states {
        let updated = state.updated_at.timestamp();
        let backend_owner = match state.id.trim() {
            "" => DEFAULT_MODEL_OWNER,
            id => id,
        };

        if state.model_meta.is_empty() {
            for name in &state.models {
                add_model(&mut models, name, updated, backend_owner, false);
            }
            continue;
        }

        for meta in &state.model_meta {
            let created = meta
                .created_at
                .map(|ts| ts.timestamp())
                .filter(|ts| *ts > 0)
                .unwrap_or(updated);
            let owner = meta.owned_by.trim();
            if owner.is_empty() || owner == DEFAULT_MODEL_OWNER {
                add_model(&mut models, &meta.name, created, backend_owner, false);
            } else {
                add_model(&mut models, &meta.name, created, owner, true);
            }
        }
    }

    let now = now.timestamp();
    ModelList {
        object: "list".to_string(),
        data: models
            .into_iter()
            .map(|(id, candidate)| ModelCatalogEntry {
                id,
                object: "model".to_string(),
                created: if candidate.created > 0 {
                    candidate.created
                } else {
                    now
                },
                owned_by: candidate.owned_by,
            })
            .collect(),
    }
}

/// Single catalog entry by id
pub fn find_model(states: &[BackendState], id: &str, now: DateTime<Utc>) -> Option<ModelCatalogEntry> {
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    merge_catalog(states, now)
        .data
        .into_iter()
        .find(|entry| entry.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelInfo;

    fn ts(raw: &str) -> DateTime<Utc> {
        raw.parse().expect("timestamp")
    }

    fn meta(name: &str, created: Option<&str>, owner: &str) -> ModelInfo {
        ModelInfo {
            name: name.into(),
            created_at: created.map(ts),
            owned_by: owner.into(),
        }
    }

    fn backend(id: &str, updated: &str, models: &[&str], meta: Vec<ModelInfo>) -> BackendState {
        let mut state = BackendState::new(id, format!("http://{id}"));
        state.updated_at = ts(updated);
        state.models = models.iter().map(|s| s.to_string()).collect();
        state.model_meta = meta;
        state
    }

    #[test]
    fn test_earliest_creation_wins() {
        let states = vec![
            backend(
                "a",
                "2024-06-01T00:00:00Z",
                &["llama3"],
                vec![meta("llama3", Some("2024-03-01T00:00:00Z"), "library")],
            ),
            backend(
                "b",
                "2024-06-01T00:00:00Z",
                &["llama3"],
                vec![meta("llama3", Some("2024-01-01T00:00:00Z"), "library")],
            ),
        ];
        let list = merge_catalog(&states, Utc::now());
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), 1);
        assert_eq!(list.data[0].created, ts("2024-01-01T00:00:00Z").timestamp());
        // placeholder owner falls back to the first reporting backend
        assert_eq!(list.data[0].owned_by, "a");
        assert_eq!(list.data[0].object, "model");
    }

    #[test]
    fn test_explicit_owner_beats_backend_id() {
        let states = vec![
            backend("a", "2024-06-01T00:00:00Z", &["m"], vec![meta("m", None, "")]),
            backend(
                "b",
                "2024-06-01T00:00:00Z",
                &["m"],
                vec![meta("m", None, "hf.co")],
            ),
        ];
        let list = merge_catalog(&states, Utc::now());
        assert_eq!(list.data[0].owned_by, "hf.co");
        // no known creation: backend updated_at stands in
        assert_eq!(list.data[0].created, ts("2024-06-01T00:00:00Z").timestamp());
    }

    #[test]
    fn test_backends_without_meta_contribute_names() {
        let states = vec![
            backend("z", "2024-02-02T00:00:00Z", &["qwen2", "llama3"], vec![]),
            backend(
                "y",
                "2024-06-01T00:00:00Z",
                &["phi3"],
                vec![meta("phi3", Some("2024-05-05T00:00:00Z"), "library")],
            ),
        ];
        let list = merge_catalog(&states, Utc::now());
        let ids: Vec<_> = list.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["llama3", "phi3", "qwen2"]);
        assert_eq!(list.data[0].owned_by, "z");
        assert_eq!(list.data[0].created, ts("2024-02-02T00:00:00Z").timestamp());
        assert_eq!(list.data[1].owned_by, "y");
    }

    #[test]
    fn test_find_model() {
        let states = vec![backend("a", "2024-06-01T00:00:00Z", &["llama3"], vec![])];
        assert!(find_model(&states, "llama3", Utc::now()).is_some());
        assert!(find_model(&states, "mistral", Utc::now()).is_none());
        assert!(find_model(&states, " ", Utc::now()).is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let states = vec![backend("a", "2024-06-01T00:00:00Z", &["llama3"], vec![])];
        let json = serde_json::to_value(merge_catalog(&states, Utc::now())).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "object": "list",
                "data": [{
                    "id": "llama3",
                    "object": "model",
                    "created": 1717200000,
                    "owned_by": "a"
                }]
            })
        );
    }
}
