// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interface to a durable key-value store.
//! "key_value_store" spelt out because in AI land "KV" means something else.
//!
//! A store holds named buckets; a bucket maps [`Key`]s to opaque bytes. Every
//! write of a single key is atomic: readers see either the old or the new value.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::{env, fmt};

use async_trait::async_trait;
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, percent_encode};
use serde::{Deserialize, Serialize};

use crate::config::environment_names::storage as env_storage;

mod mem;
pub use mem::MemoryStore;
mod file;
pub use file::FileStore;

/// String we use as the Key in a key-value storage operation. Simple String wrapper
/// that can encode / decode a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    pub fn new(s: String) -> Key {
        Key(s)
    }

    /// Takes a URL-safe percent-encoded string and creates a Key from it by decoding first.
    /// gpu%2Da becomes gpu-a
    pub fn from_url_safe(s: &str) -> Key {
        Key(percent_decode_str(s).decode_utf8_lossy().to_string())
    }

    /// A URL-safe percent-encoded representation of this key.
    /// e.g. `models/llama3:8b` becomes `models%2Fllama3%3A8b`
    pub fn url_safe(&self) -> Cow<'_, str> {
        percent_encode(self.0.as_bytes(), NON_ALPHANUMERIC).into()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Key {
        Key::new(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Key {
        Key::new(s)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&Key> for String {
    fn from(k: &Key) -> String {
        k.0.clone()
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_or_create_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<Box<dyn KeyValueBucket>, StoreError>;

    async fn get_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<Option<Box<dyn KeyValueBucket>>, StoreError>;

    fn connection_id(&self) -> u64;
}

/// Which store backs a process. Parsed from `mem`, `file` or `file:<dir>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Selector {
    File(PathBuf),
    #[default]
    Memory,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::File(path) => write!(f, "file:{}", path.display()),
            Selector::Memory => write!(f, "mem"),
        }
    }
}

impl FromStr for Selector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Selector> {
        match s.trim() {
            "file" => {
                let root = env::var(env_storage::LLAMERO_FILE_KV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| env::temp_dir().join("llamero_kv"));
                Ok(Self::File(root))
            }
            "mem" => Ok(Self::Memory),
            x => match x.strip_prefix("file:") {
                Some(dir) if !dir.trim().is_empty() => Ok(Self::File(PathBuf::from(dir.trim()))),
                _ => anyhow::bail!("Unknown key-value store type '{x}'"),
            },
        }
    }
}

impl TryFrom<String> for Selector {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Selector> {
        s.parse()
    }
}

impl From<Selector> for String {
    fn from(s: Selector) -> String {
        s.to_string()
    }
}

enum KeyValueStoreEnum {
    Memory(MemoryStore),
    File(FileStore),
}

impl KeyValueStoreEnum {
    fn inner(&self) -> &dyn KeyValueStore {
        match self {
            KeyValueStoreEnum::Memory(x) => x,
            KeyValueStoreEnum::File(x) => x,
        }
    }
}

#[derive(Clone)]
pub struct KeyValueStoreManager(Arc<KeyValueStoreEnum>);

impl Default for KeyValueStoreManager {
    fn default() -> Self {
        KeyValueStoreManager::memory()
    }
}

impl fmt::Debug for KeyValueStoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_ref() {
            KeyValueStoreEnum::Memory(_) => write!(f, "KeyValueStoreManager(Memory)"),
            KeyValueStoreEnum::File(x) => write!(f, "KeyValueStoreManager({x})"),
        }
    }
}

impl KeyValueStoreManager {
    /// In-memory store. Single process only, lost on exit.
    pub fn memory() -> Self {
        Self::new(KeyValueStoreEnum::Memory(MemoryStore::new()))
    }

    /// Directory-backed store. Several processes may share one root.
    pub fn file<P: Into<PathBuf>>(root: P) -> Self {
        Self::new(KeyValueStoreEnum::File(FileStore::new(root)))
    }

    pub fn from_selector(selector: &Selector) -> Self {
        match selector {
            Selector::Memory => Self::memory(),
            Selector::File(root) => Self::file(root.clone()),
        }
    }

    fn new(s: KeyValueStoreEnum) -> KeyValueStoreManager {
        KeyValueStoreManager(Arc::new(s))
    }

    pub async fn get_or_create_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<Box<dyn KeyValueBucket>, StoreError> {
        self.0.inner().get_or_create_bucket(bucket_name).await
    }

    pub async fn get_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<Option<Box<dyn KeyValueBucket>>, StoreError> {
        self.0.inner().get_bucket(bucket_name).await
    }

    pub fn connection_id(&self) -> u64 {
        self.0.inner().connection_id()
    }

    /// Fetch and decode one JSON value
    pub async fn load<T: for<'a> Deserialize<'a>>(
        &self,
        bucket: &str,
        key: &Key,
    ) -> Result<Option<T>, StoreError> {
        let Some(bucket) = self.get_bucket(bucket).await? else {
            // No bucket means no entries
            return Ok(None);
        };
        Ok(match bucket.get(key).await? {
            Some(bytes) => Some(serde_json::from_slice(bytes.as_ref())?),
            None => None,
        })
    }

    /// Encode `obj` as JSON and replace whatever is stored at `key`
    pub async fn save<T: Serialize + Sync>(
        &self,
        bucket_name: &str,
        key: &Key,
        obj: &T,
    ) -> Result<(), StoreError> {
        let obj_json = serde_json::to_vec(obj)?;
        let bucket = self.get_or_create_bucket(bucket_name).await?;
        bucket.put(key, obj_json.into()).await
    }

    /// Encode `obj` as JSON and store it only if `key` is free
    pub async fn create<T: Serialize + Sync>(
        &self,
        bucket_name: &str,
        key: &Key,
        obj: &T,
    ) -> Result<StoreOutcome, StoreError> {
        let obj_json = serde_json::to_vec(obj)?;
        let bucket = self.get_or_create_bucket(bucket_name).await?;
        bucket.insert(key, obj_json.into()).await
    }

    /// Returns true if the key existed
    pub async fn remove(&self, bucket_name: &str, key: &Key) -> Result<bool, StoreError> {
        let Some(bucket) = self.get_bucket(bucket_name).await? else {
            return Ok(false);
        };
        bucket.delete(key).await
    }

    /// Every decodable entry in the bucket, ordered by key.
    /// Entries that fail to decode are logged and skipped.
    pub async fn list<T: for<'a> Deserialize<'a>>(
        &self,
        bucket_name: &str,
    ) -> Result<Vec<(Key, T)>, StoreError> {
        let Some(bucket) = self.get_bucket(bucket_name).await? else {
            return Ok(vec![]);
        };
        let mut out = Vec::new();
        for (key, bytes) in bucket.entries().await? {
            match serde_json::from_slice::<T>(bytes.as_ref()) {
                Ok(value) => out.push((key, value)),
                Err(err) => {
                    tracing::warn!(bucket = bucket_name, %key, %err, "Skipping undecodable entry");
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// An online storage for key-value config values.
#[async_trait]
pub trait KeyValueBucket: Send + Sync {
    /// Insert a value into a bucket, if it doesn't exist already.
    /// The Key should be the name of the item, not including the bucket name.
    async fn insert(&self, key: &Key, value: bytes::Bytes) -> Result<StoreOutcome, StoreError>;

    /// Create or replace a value.
    async fn put(&self, key: &Key, value: bytes::Bytes) -> Result<(), StoreError>;

    /// Fetch an item from the key-value storage
    async fn get(&self, key: &Key) -> Result<Option<bytes::Bytes>, StoreError>;

    /// Delete an item from the bucket. Returns false if it was not there.
    async fn delete(&self, key: &Key) -> Result<bool, StoreError>;

    /// The entries in this bucket, keyed the same way as `get`.
    async fn entries(&self) -> Result<HashMap<Key, bytes::Bytes>, StoreError>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreOutcome {
    /// The operation succeeded and created a new entry.
    Created,
    /// The operation did not do anything, the key was already present.
    Exists,
}

impl fmt::Display for StoreOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOutcome::Created => write!(f, "Created"),
            StoreOutcome::Exists => write!(f, "Exists"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Could not find bucket '{0}'")]
    MissingBucket(String),

    #[error("Internal filesystem error: {0}")]
    FilesystemError(String),

    #[error("Error decoding bytes: {0}")]
    JSONDecodeError(#[from] serde_json::error::Error),
}
