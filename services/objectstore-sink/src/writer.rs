//! Local file writer owning one open partition file.

use crate::error::{Result, SinkError};
use crate::partition::PartitionKey;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::debug;

/// Size and age counters of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub opened_at: Instant,
    pub bytes_written: u64,
    pub record_count: u64,
}

/// A finalized local file, ready to be uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    pub local_path: PathBuf,
    /// Object key the file is uploaded to
    pub remote_path: String,
    pub partition_key: PartitionKey,
    pub size_bytes: u64,
    pub record_count: u64,
    pub closed_at: DateTime<Utc>,
}

/// Sequential writer for a single partition file
#[derive(Debug)]
pub struct LocalFileWriter {
    path: PathBuf,
    remote_path: String,
    partition_key: PartitionKey,
    file: Option<BufWriter<File>>,
    stats: WriterStats,
}

impl LocalFileWriter {
    /// Create the file (and its parent directories). Fails if the file already exists.
    pub async fn open(
        path: PathBuf,
        partition_key: PartitionKey,
        remote_path: String,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SinkError::local_write(parent, e))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| SinkError::local_write(&path, e))?;

        debug!(path = %path.display(), partition = %partition_key, "Opened local file");

        Ok(Self {
            path,
            remote_path,
            partition_key,
            file: Some(BufWriter::new(file)),
            stats: WriterStats {
                opened_at: Instant::now(),
                bytes_written: 0,
                record_count: 0,
            },
        })
    }

    /// Append one encoded record
    pub async fn append(&mut self, bytes: &[u8]) -> Result<WriterStats> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SinkError::AlreadyClosed(self.path.clone()))?;

        file.write_all(bytes)
            .await
            .map_err(|e| SinkError::local_write(&self.path, e))?;

        self.stats.bytes_written += bytes.len() as u64;
        self.stats.record_count += 1;
        Ok(self.stats)
    }

    /// Flush and fsync the file, handing back its descriptor
    pub async fn close(&mut self) -> Result<ClosedFile> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| SinkError::AlreadyClosed(self.path.clone()))?;

        file.flush()
            .await
            .map_err(|e| SinkError::local_write(&self.path, e))?;
        file.get_ref()
            .sync_all()
            .await
            .map_err(|e| SinkError::local_write(&self.path, e))?;

        Ok(ClosedFile {
            local_path: self.path.clone(),
            remote_path: self.remote_path.clone(),
            partition_key: self.partition_key.clone(),
            size_bytes: self.stats.bytes_written,
            record_count: self.stats.record_count,
            closed_at: Utc::now(),
        })
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

/// Name of the `sequence`-th file of a partition
pub fn file_name(instance_id: &str, sequence: u64, extension: &str) -> String {
    if instance_id.is_empty() {
        format!("{:06}.{}", sequence, extension)
    } else {
        format!("{}-{:06}.{}", instance_id, sequence, extension)
    }
}

/// Object key for a file at `relative` (to the local base directory)
pub fn remote_key(prefix: &str, relative: &Path) -> String {
    let prefix = prefix.trim_matches('/');
    let mut parts: Vec<String> = Vec::new();
    if !prefix.is_empty() {
        parts.push(prefix.to_string());
    }
    parts.extend(relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    }));
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> PartitionKey {
        PartitionKey::new(vec!["orders".into(), "dt=2024-01-15".into()])
    }

    #[tokio::test]
    async fn test_append_preserves_order_and_counts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orders/dt=2024-01-15/000000.jsonl");

        let mut writer = LocalFileWriter::open(path.clone(), key(), "orders/000000.jsonl".into())
            .await
            .unwrap();
        writer.append(b"first\n").await.unwrap();
        let stats = writer.append(b"second\n").await.unwrap();
        assert_eq!(stats.bytes_written, 13);
        assert_eq!(stats.record_count, 2);

        let closed = writer.close().await.unwrap();
        assert_eq!(closed.local_path, path);
        assert_eq!(closed.remote_path, "orders/000000.jsonl");
        assert_eq!(closed.size_bytes, 13);
        assert_eq!(closed.record_count, 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"first\nsecond\n");
    }

    #[tokio::test]
    async fn test_double_close_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/000000.bin");

        let mut writer = LocalFileWriter::open(path, key(), "a/000000.bin".into())
            .await
            .unwrap();
        writer.append(b"x").await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.is_closed());

        assert!(matches!(writer.close().await, Err(SinkError::AlreadyClosed(_))));
        assert!(matches!(writer.append(b"y").await, Err(SinkError::AlreadyClosed(_))));
    }

    #[tokio::test]
    async fn test_open_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000.bin");
        std::fs::write(&path, b"pending upload").unwrap();

        let err = LocalFileWriter::open(path.clone(), key(), String::new())
            .await
            .unwrap_err();
        match err {
            SinkError::LocalWrite { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"pending upload");
    }

    #[tokio::test]
    async fn test_open_fails_when_parent_is_a_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), b"").unwrap();

        let result =
            LocalFileWriter::open(dir.path().join("blocker/000000.bin"), key(), String::new()).await;
        assert!(matches!(result, Err(SinkError::LocalWrite { .. })));
    }

    #[test]
    fn test_file_naming() {
        assert_eq!(file_name("", 7, "jsonl"), "000007.jsonl");
        assert_eq!(file_name("host-1", 12, "bin"), "host-1-000012.bin");
        assert_eq!(
            remote_key("/sink/", Path::new("orders/dt=2024-01-15/000007.jsonl")),
            "sink/orders/dt=2024-01-15/000007.jsonl"
        );
        assert_eq!(remote_key("", Path::new("orders/000001.bin")), "orders/000001.bin");
    }
}
