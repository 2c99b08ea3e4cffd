//! Remote object storage backends.
//!
//! The upload manager only needs create-or-overwrite semantics plus a
//! retryable/terminal split of failures; everything else about the remote
//! protocol stays behind [`ObjectStore`].

mod local;
mod s3;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

use crate::config::StorageConfig;
use crate::error::{SinkError, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Create-or-overwrite access to a remote object store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` at `key`, replacing any existing object
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError>;
}

pub type ObjectStoreRef = Arc<dyn ObjectStore>;

/// Build the backend selected by configuration
pub async fn from_config(config: &StorageConfig) -> Result<ObjectStoreRef, SinkError> {
    match config {
        StorageConfig::S3(s3) => Ok(Arc::new(S3ObjectStore::new(s3).await?)),
        StorageConfig::Local(local) => Ok(Arc::new(LocalObjectStore::new(&local.root))),
    }
}

/// Content type for an object key, from its extension
pub(crate) fn content_type(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "jsonl" || ext == "ndjson" => "application/x-ndjson",
        Some(ext) if ext == "json" => "application/json",
        _ => "application/octet-stream",
    }
}
