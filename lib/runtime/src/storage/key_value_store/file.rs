// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Key, KeyValueBucket, KeyValueStore, StoreError, StoreOutcome};

/// Prefix of in-progress writes. Encoded keys never start with it.
const TEMP_PREFIX: &str = ".";

/// One directory per bucket under `root`, one file per key.
/// File names are the percent-encoded key. Values are written to a temp file
/// then moved into place, so readers in other processes never see a partial value.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
    connection_id: u64,
    /// Buckets already checked or created by this process.
    active_dirs: Arc<Mutex<HashMap<PathBuf, Directory>>>,
}

impl FileStore {
    pub(super) fn new<P: Into<PathBuf>>(root_dir: P) -> Self {
        FileStore {
            root: root_dir.into(),
            connection_id: rand::random::<u64>(),
            active_dirs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn bucket_path(&self, bucket_name: &str) -> PathBuf {
        self.root.join(Key::from(bucket_name).url_safe().as_ref())
    }
}

impl fmt::Display for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FileStore({})", self.root.display())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    /// A "bucket" is a directory
    async fn get_or_create_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<Box<dyn KeyValueBucket>, StoreError> {
        let p = self.bucket_path(bucket_name);
        if let Some(dir) = self.active_dirs.lock().get(&p) {
            return Ok(Box::new(dir.clone()));
        };

        if p.exists() {
            if !p.is_dir() {
                return Err(StoreError::FilesystemError(format!(
                    "Bucket {} is not a directory",
                    p.display()
                )));
            }
        } else {
            fs::create_dir_all(&p)
                .with_context(|| p.display().to_string())
                .map_err(a_to_fs_err)?;
        }
        let dir = Directory::new(p.clone());
        self.active_dirs.lock().insert(p, dir.clone());
        Ok(Box::new(dir))
    }

    /// A "bucket" is a directory
    async fn get_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<Option<Box<dyn KeyValueBucket>>, StoreError> {
        let p = self.bucket_path(bucket_name);
        if let Some(dir) = self.active_dirs.lock().get(&p) {
            return Ok(Some(Box::new(dir.clone())));
        };

        if !p.exists() {
            return Ok(None);
        }
        if !p.is_dir() {
            return Err(StoreError::FilesystemError(format!(
                "Bucket {} is not a directory",
                p.display()
            )));
        }
        let dir = Directory::new(p.clone());
        self.active_dirs.lock().insert(p, dir.clone());
        Ok(Some(Box::new(dir)))
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

#[derive(Clone)]
pub struct Directory {
    p: PathBuf,
}

impl Directory {
    fn new(p: PathBuf) -> Self {
        Directory { p }
    }

    fn key_path(&self, key: &Key) -> PathBuf {
        self.p.join(key.url_safe().as_ref())
    }

    /// Write `value` next to its final location under a unique name.
    fn write_temp(&self, key: &Key, value: &[u8]) -> anyhow::Result<PathBuf> {
        let tmp = self.p.join(format!(
            "{TEMP_PREFIX}{}.{}.tmp",
            key.url_safe(),
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&tmp, value).with_context(|| tmp.display().to_string())?;
        Ok(tmp)
    }
}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.p.display())
    }
}

#[async_trait]
impl KeyValueBucket for Directory {
    /// Link a fully written temp file into place. Linking fails if the key exists.
    async fn insert(&self, key: &Key, value: bytes::Bytes) -> Result<StoreOutcome, StoreError> {
        let full_path = self.key_path(key);
        let tmp = self.write_temp(key, &value).map_err(a_to_fs_err)?;
        let linked = fs::hard_link(&tmp, &full_path);
        remove_quietly(&tmp);
        match linked {
            Ok(()) => Ok(StoreOutcome::Created),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(StoreOutcome::Exists),
            Err(err) => Err(StoreError::FilesystemError(format!(
                "{}: {err}",
                full_path.display()
            ))),
        }
    }

    /// Replace a file in the directory
    async fn put(&self, key: &Key, value: bytes::Bytes) -> Result<(), StoreError> {
        let full_path = self.key_path(key);
        let tmp = self.write_temp(key, &value).map_err(a_to_fs_err)?;
        if let Err(err) = fs::rename(&tmp, &full_path) {
            remove_quietly(&tmp);
            return Err(StoreError::FilesystemError(format!(
                "{}: {err}",
                full_path.display()
            )));
        }
        Ok(())
    }

    /// Read a file from the directory
    async fn get(&self, key: &Key) -> Result<Option<bytes::Bytes>, StoreError> {
        let full_path = self.key_path(key);
        match fs::read(&full_path) {
            Ok(data) => Ok(Some(data.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::FilesystemError(format!(
                "{}: {err}",
                full_path.display()
            ))),
        }
    }

    /// Delete a file from the directory
    async fn delete(&self, key: &Key) -> Result<bool, StoreError> {
        let full_path = self.key_path(key);
        match fs::remove_file(&full_path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::FilesystemError(format!(
                "{}: {err}",
                full_path.display()
            ))),
        }
    }

    async fn entries(&self) -> Result<HashMap<Key, bytes::Bytes>, StoreError> {
        let contents = fs::read_dir(&self.p)
            .with_context(|| self.p.display().to_string())
            .map_err(a_to_fs_err)?;
        let mut out = HashMap::new();
        for entry in contents {
            let entry = entry.map_err(to_fs_err)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if !entry.path().is_file() {
                tracing::warn!(
                    path = %entry.path().display(),
                    "Unexpected entry, directory should only contain files."
                );
                continue;
            }
            let data = match fs::read(entry.path()) {
                Ok(data) => data,
                // removed by another process between listing and reading
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(to_fs_err(err)),
            };
            out.insert(Key::from_url_safe(&name), data.into());
        }
        Ok(out)
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %err, "Failed removing temp file");
    }
}

// For anyhow preserve the context
fn a_to_fs_err(err: anyhow::Error) -> StoreError {
    StoreError::FilesystemError(format!("{err:#}"))
}

fn to_fs_err<E: std::error::Error>(err: E) -> StoreError {
    StoreError::FilesystemError(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_round_trip_across_instances() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let a = FileStore::new(root.path());
        let b = FileStore::new(root.path());
        assert_ne!(a.connection_id(), b.connection_id());

        let bucket = a.get_or_create_bucket("backends").await?;
        bucket.put(&"gpu/a".into(), "{}".into()).await?;

        // key is encoded so the slash does not create a subdirectory
        assert!(root.path().join("backends").join("gpu%2Fa").is_file());

        let other = b.get_bucket("backends").await?.expect("bucket exists on disk");
        assert_eq!(other.get(&"gpu/a".into()).await?, Some("{}".into()));
        let entries = other.entries().await?;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&Key::from("gpu/a")));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_insert_is_create_only() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = FileStore::new(root.path());
        let bucket = store.get_or_create_bucket("leases").await?;

        assert_eq!(
            bucket.insert(&"task-1".into(), "w1".into()).await?,
            StoreOutcome::Created
        );
        assert_eq!(
            bucket.insert(&"task-1".into(), "w2".into()).await?,
            StoreOutcome::Exists
        );
        assert_eq!(bucket.get(&"task-1".into()).await?, Some("w1".into()));

        // no temp files left behind
        let names: Vec<_> = fs::read_dir(root.path().join("leases"))?
            .map(|e| e.map(|e| e.file_name()))
            .collect::<Result<_, _>>()?;
        assert_eq!(names.len(), 1);

        assert!(bucket.delete(&"task-1".into()).await?);
        assert!(!bucket.delete(&"task-1".into()).await?);
        assert!(bucket.get(&"task-1".into()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_entries_skip_temp_files() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = FileStore::new(root.path());
        let bucket = store.get_or_create_bucket("tasks").await?;
        bucket.put(&"t1".into(), "1".into()).await?;
        fs::write(root.path().join("tasks").join(".t2.abc.tmp"), "partial")?;

        let entries = bucket.entries().await?;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&Key::from("t1")));
        Ok(())
    }

    #[tokio::test]
    async fn test_bucket_path_must_be_directory() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        fs::write(root.path().join("backends"), "oops")?;
        let store = FileStore::new(root.path());
        assert!(store.get_or_create_bucket("backends").await.is_err());
        assert!(store.get_bucket("backends").await.is_err());
        Ok(())
    }
}
