// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng as _;
use tokio::sync::Mutex;

use super::{Key, KeyValueBucket, KeyValueStore, StoreError, StoreOutcome};

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
    connection_id: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryStoreInner {
    data: Mutex<HashMap<String, MemoryBucket>>,
}

pub struct MemoryBucketRef {
    name: String,
    inner: Arc<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryBucket {
    data: HashMap<Key, bytes::Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(MemoryStoreInner {
                data: Mutex::new(HashMap::new()),
            }),
            connection_id: rand::rng().random(),
        }
    }

    fn bucket_ref(&self, bucket_name: &str) -> MemoryBucketRef {
        MemoryBucketRef {
            name: bucket_name.to_string(),
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_or_create_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<Box<dyn KeyValueBucket>, StoreError> {
        let mut locked_data = self.inner.data.lock().await;
        locked_data.entry(bucket_name.to_string()).or_default();
        Ok(Box::new(self.bucket_ref(bucket_name)))
    }

    /// This operation cannot fail on MemoryStore. Always returns Ok.
    async fn get_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<Option<Box<dyn KeyValueBucket>>, StoreError> {
        let locked_data = self.inner.data.lock().await;
        if !locked_data.contains_key(bucket_name) {
            return Ok(None);
        }
        Ok(Some(Box::new(self.bucket_ref(bucket_name))))
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

#[async_trait]
impl KeyValueBucket for MemoryBucketRef {
    async fn insert(&self, key: &Key, value: bytes::Bytes) -> Result<StoreOutcome, StoreError> {
        let mut locked_data = self.inner.data.lock().await;
        let Some(bucket) = locked_data.get_mut(&self.name) else {
            return Err(StoreError::MissingBucket(self.name.to_string()));
        };
        Ok(match bucket.data.entry(key.clone()) {
            Entry::Vacant(e) => {
                e.insert(value);
                StoreOutcome::Created
            }
            Entry::Occupied(_) => StoreOutcome::Exists,
        })
    }

    async fn put(&self, key: &Key, value: bytes::Bytes) -> Result<(), StoreError> {
        let mut locked_data = self.inner.data.lock().await;
        let Some(bucket) = locked_data.get_mut(&self.name) else {
            return Err(StoreError::MissingBucket(self.name.to_string()));
        };
        bucket.data.insert(key.clone(), value);
        Ok(())
    }

    async fn get(&self, key: &Key) -> Result<Option<bytes::Bytes>, StoreError> {
        let locked_data = self.inner.data.lock().await;
        let Some(bucket) = locked_data.get(&self.name) else {
            return Ok(None);
        };
        Ok(bucket.data.get(key).cloned())
    }

    async fn delete(&self, key: &Key) -> Result<bool, StoreError> {
        let mut locked_data = self.inner.data.lock().await;
        let Some(bucket) = locked_data.get_mut(&self.name) else {
            return Ok(false);
        };
        Ok(bucket.data.remove(key).is_some())
    }

    async fn entries(&self) -> Result<HashMap<Key, bytes::Bytes>, StoreError> {
        let locked_data = self.inner.data.lock().await;
        match locked_data.get(&self.name) {
            Some(bucket) => Ok(bucket.data.clone()),
            None => Err(StoreError::MissingBucket(self.name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_buckets_are_shared_between_clones() -> anyhow::Result<()> {
        let s = MemoryStore::new();
        let s2 = s.clone();
        assert!(s.get_bucket("tasks").await?.is_none());

        let bucket = s.get_or_create_bucket("tasks").await?;
        bucket.put(&"t1".into(), "one".into()).await?;

        let b2 = s2.get_bucket("tasks").await?.expect("bucket visible to clone");
        assert_eq!(b2.get(&"t1".into()).await?, Some("one".into()));
        assert_eq!(s.connection_id(), s2.connection_id());

        assert_eq!(
            b2.insert(&"t1".into(), "again".into()).await?,
            StoreOutcome::Exists
        );
        assert!(b2.delete(&"t1".into()).await?);
        assert!(bucket.entries().await?.is_empty());
        Ok(())
    }
}
