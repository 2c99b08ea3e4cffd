//! The sink facade: wires config, store, orchestrator, sweeper, and uploads.

use crate::config::Config;
use crate::error::{Result, SinkError};
use crate::message::{IncomingMessage, MessageDeserializer, Record};
use crate::offsets::TopicPartition;
use crate::orchestrator::WriterOrchestrator;
use crate::partition::PartitionKey;
use crate::store::{self, ObjectStoreRef};
use crate::upload::{UploadManager, UploadStats};
use crate::writer::{remote_key, ClosedFile};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Buffers records into partitioned local files and ships them to object storage
pub struct ObjectStorageSink {
    config: Config,
    deserializer: MessageDeserializer,
    orchestrator: Arc<WriterOrchestrator>,
    uploads: Arc<UploadManager>,
    sweep_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ObjectStorageSink {
    /// Start the sink against the store named in `config.storage`
    pub async fn start(config: Config) -> Result<Self> {
        let store = store::from_config(&config.storage).await?;
        Self::with_store(config, store).await
    }

    /// Start the sink against an already built store
    pub async fn with_store(config: Config, store: ObjectStoreRef) -> Result<Self> {
        config.validate()?;

        let uploads = Arc::new(UploadManager::spawn(store, &config.upload));

        let recovered = if config.local.recover_on_start {
            recover_orphans(&config.local.base_dir, &config.upload.remote_prefix, &uploads).await?
        } else {
            Vec::new()
        };

        let orchestrator = Arc::new(WriterOrchestrator::new(&config, uploads.clone())?);
        orchestrator.reserve_sequences(&recovered).await;
        let sweep_token = CancellationToken::new();
        let sweeper =
            orchestrator.spawn_sweeper(config.rotation.sweep_interval(), sweep_token.clone());

        info!(
            base_dir = %config.local.base_dir.display(),
            format = ?config.local.file_format,
            granularity = ?config.partitioning.granularity,
            "Sink started"
        );

        Ok(Self {
            deserializer: MessageDeserializer::new(config.local.file_format),
            config,
            orchestrator,
            uploads,
            sweep_token,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Decode a broker message and buffer it
    pub async fn push(&self, message: IncomingMessage) -> Result<()> {
        let record = self.deserializer.deserialize(message)?;
        self.orchestrator.submit(record).await
    }

    /// Buffer an already decoded record
    pub async fn submit(&self, record: Record) -> Result<()> {
        self.orchestrator.submit(record).await
    }

    /// Cancelled once the sink hit a fatal error and stopped accepting records
    pub fn halted(&self) -> CancellationToken {
        self.orchestrator.halted()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.orchestrator.fatal_error()
    }

    /// Next offset to commit per topic-partition; only covers uploaded records
    pub fn committable_offsets(&self) -> BTreeMap<TopicPartition, i64> {
        self.uploads.offsets().committable()
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.uploads.stats()
    }

    pub fn orchestrator(&self) -> &Arc<WriterOrchestrator> {
        &self.orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the sweeper, close every open file, and drain uploads within the
    /// configured grace period.
    ///
    /// Uploads are drained even if closing a file failed; that failure is
    /// returned afterwards.
    pub async fn shutdown(&self) -> Result<UploadStats> {
        info!("Shutting down sink");
        self.sweep_token.cancel();

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Sweeper had stopped with an error"),
                Err(e) => error!(error = %e, "Sweeper task failed"),
            }
        }

        let closed = self.orchestrator.close_all().await;
        let stats = self.uploads.shutdown(self.config.upload.shutdown_grace()).await;

        closed?;
        Ok(stats)
    }
}

/// Queue every file left under `base_dir` by an earlier process and return them.
///
/// Files keep the remote key they would have had, so re-uploading one that
/// already made it to the store overwrites the object with the same bytes.
pub async fn recover_orphans(
    base_dir: &Path,
    remote_prefix: &str,
    uploads: &UploadManager,
) -> Result<Vec<ClosedFile>> {
    let files = match list_files(base_dir).await {
        Ok(files) => files,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SinkError::local_write(base_dir, e)),
    };

    let mut recovered = Vec::with_capacity(files.len());
    for (path, size_bytes) in files {
        let Ok(relative) = path.strip_prefix(base_dir) else {
            continue;
        };
        let segments: Vec<String> = relative
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let file = ClosedFile {
            remote_path: remote_key(remote_prefix, relative),
            local_path: path.clone(),
            partition_key: PartitionKey::new(segments),
            size_bytes,
            record_count: 0,
            closed_at: Utc::now(),
        };
        uploads.enqueue(file.clone())?;
        recovered.push(file);
    }

    if !recovered.is_empty() {
        info!(files = recovered.len(), "Re-queued files left by a previous run");
    }
    Ok(recovered)
}

/// Regular, non-hidden files below `root`, sorted by path
async fn list_files(root: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() && !hidden {
                let size = entry.metadata().await?.len();
                files.push((entry.path(), size));
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::store::LocalObjectStore;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_recover_orphans_keeps_remote_layout() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("buffer");
        let partition = base.join("orders/dt=2024-01-15/hr=10");
        std::fs::create_dir_all(&partition).unwrap();
        std::fs::write(partition.join("000003.jsonl"), b"{\"id\":3}\n").unwrap();
        std::fs::write(partition.join(".DS_Store"), b"").unwrap();

        let remote = dir.path().join("remote");
        let uploads = UploadManager::spawn(
            Arc::new(LocalObjectStore::new(&remote)),
            &UploadConfig::default(),
        );

        let recovered = recover_orphans(&base, "sink", &uploads).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].partition_key.to_string(), "orders/dt=2024-01-15/hr=10");
        assert_eq!(recovered[0].size_bytes, 9);
        let stats = uploads.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.succeeded, 1);

        assert_eq!(
            std::fs::read(remote.join("sink/orders/dt=2024-01-15/hr=10/000003.jsonl")).unwrap(),
            b"{\"id\":3}\n"
        );
        assert!(!partition.join("000003.jsonl").exists());
        assert!(partition.join(".DS_Store").exists());
    }

    #[tokio::test]
    async fn test_recover_orphans_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let uploads = UploadManager::spawn(
            Arc::new(LocalObjectStore::new(dir.path().join("remote"))),
            &UploadConfig::default(),
        );
        let recovered = recover_orphans(&dir.path().join("nope"), "", &uploads)
            .await
            .unwrap();
        assert!(recovered.is_empty());
    }
}
