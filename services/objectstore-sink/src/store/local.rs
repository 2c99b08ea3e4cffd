use super::ObjectStore;
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Object store backed by a directory tree
///
/// Objects are written to a temporary sibling and renamed into place, so a
/// reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::Terminal(format!("invalid object key {:?}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        let staging = path.with_extension("partial");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(classify)?;
        }
        fs::write(&staging, &body).await.map_err(classify)?;
        fs::rename(&staging, &path).await.map_err(classify)?;

        debug!(key = %key, size_bytes = body.len(), "Object written");
        Ok(())
    }
}

fn classify(e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::InvalidData => {
            StoreError::Terminal(e.to_string())
        }
        _ => StoreError::Retryable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_overwrites_existing_object() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .put_object("orders/dt=2024-01-15/000000.jsonl", Bytes::from_static(b"old"))
            .await
            .unwrap();
        store
            .put_object("orders/dt=2024-01-15/000000.jsonl", Bytes::from_static(b"new"))
            .await
            .unwrap();

        let object = dir.path().join("orders/dt=2024-01-15/000000.jsonl");
        assert_eq!(std::fs::read(&object).unwrap(), b"new");
        let entries = std::fs::read_dir(object.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());

        for key in ["../escape", "/abs/path", ""] {
            let err = store
                .put_object(key, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert!(!err.is_retryable(), "key {:?}", key);
        }
    }
}
