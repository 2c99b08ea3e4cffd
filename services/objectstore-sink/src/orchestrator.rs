//! Writer orchestrator: routes records to per-partition files and rotates them.
//!
//! The table of active writers lives behind a single async mutex. Appends,
//! policy evaluation, and rotation all happen while holding it, so a sweep can
//! never close a file between an append and the policy check that follows it.
//! Closed files are handed to the [`UploadManager`], which never blocks.

use crate::config::Config;
use crate::error::{Result, SinkError};
use crate::message::{Record, RecordEncoder};
use crate::partition::{PartitionKey, PartitionResolver};
use crate::policy::RotationPolicySet;
use crate::upload::UploadManager;
use crate::writer::{file_name, remote_key, ClosedFile, LocalFileWriter};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct WriterTable {
    active: HashMap<PartitionKey, LocalFileWriter>,
    /// Next file sequence per partition. Never reset while the process runs.
    sequences: HashMap<PartitionKey, u64>,
}

/// Owns every open partition file
pub struct WriterOrchestrator {
    base_dir: PathBuf,
    remote_prefix: String,
    instance_id: String,
    extension: &'static str,
    resolver: PartitionResolver,
    encoder: RecordEncoder,
    policies: RotationPolicySet,
    uploads: Arc<UploadManager>,
    table: AsyncMutex<WriterTable>,
    fatal: Mutex<Option<String>>,
    halted: CancellationToken,
}

impl WriterOrchestrator {
    pub fn new(config: &Config, uploads: Arc<UploadManager>) -> Result<Self> {
        Self::with_policies(config, RotationPolicySet::from_config(&config.rotation), uploads)
    }

    /// Build with an explicit rotation policy set
    pub fn with_policies(
        config: &Config,
        policies: RotationPolicySet,
        uploads: Arc<UploadManager>,
    ) -> Result<Self> {
        Ok(Self {
            base_dir: config.local.base_dir.clone(),
            remote_prefix: config.upload.remote_prefix.clone(),
            instance_id: config.local.instance_id.clone(),
            extension: config.local.file_format.extension(),
            resolver: PartitionResolver::new(&config.partitioning)?,
            encoder: RecordEncoder::new(&config.local),
            policies,
            uploads,
            table: AsyncMutex::new(WriterTable::default()),
            fatal: Mutex::new(None),
            halted: CancellationToken::new(),
        })
    }

    /// Append a record to the file of its partition, opening one if needed.
    ///
    /// Returns once the bytes are handed to the local file. Files that became
    /// due are closed and queued for upload before this returns.
    pub async fn submit(&self, record: Record) -> Result<()> {
        self.check_halted()?;

        let bytes = self.encoder.encode(&record)?;
        let key = self.resolver.resolve(&record);

        let mut table = self.table.lock().await;
        let WriterTable { active, sequences } = &mut *table;

        // An expired file must not take more data
        if let Some(reason) = active
            .get(&key)
            .and_then(|w| self.policies.triggered(&w.stats(), Instant::now()))
        {
            self.rotate(active, &key, reason).await?;
        }

        let writer = match active.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let writer = self.open_writer(entry.key(), sequences).await?;
                entry.insert(writer)
            }
        };

        let stats = writer.append(&bytes).await.map_err(|e| self.latch(e))?;
        self.uploads
            .offsets()
            .record(writer.path(), &record.topic, record.partition, record.offset);

        if let Some(reason) = self.policies.triggered(&stats, Instant::now()) {
            let key = writer.partition_key().clone();
            self.rotate(active, &key, reason).await?;
        }

        Ok(())
    }

    /// Close every file whose sweep-eligible policy (age) fired.
    ///
    /// Returns how many files were rotated.
    pub async fn sweep(&self) -> Result<usize> {
        self.check_halted()?;

        let mut table = self.table.lock().await;
        let now = Instant::now();
        let due: Vec<(PartitionKey, &'static str)> = table
            .active
            .iter()
            .filter_map(|(key, writer)| {
                self.policies
                    .triggered_on_sweep(&writer.stats(), now)
                    .map(|reason| (key.clone(), reason))
            })
            .collect();

        for (key, reason) in &due {
            self.rotate(&mut table.active, key, *reason).await?;
        }

        if !due.is_empty() {
            debug!(rotated = due.len(), "Sweep rotated idle files");
        }
        Ok(due.len())
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `token` is cancelled
    /// or a sweep hits a fatal error.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Sweeper stopped");
                        return Ok(());
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = this.sweep().await {
                            error!(error = %e, "Sweep failed, stopping sweeper");
                            return Err(e);
                        }
                    }
                }
            }
        })
    }

    /// Close every open file regardless of policy and queue it for upload.
    ///
    /// Keeps going past individual failures and returns the first one.
    pub async fn close_all(&self) -> Result<usize> {
        let mut table = self.table.lock().await;
        let keys: Vec<PartitionKey> = table.active.keys().cloned().collect();

        let mut closed = 0;
        let mut first_error = None;
        for key in keys {
            match self.rotate(&mut table.active, &key, "shutdown").await {
                Ok(()) => closed += 1,
                Err(e) => {
                    warn!(partition = %key, error = %e, "Failed to close file");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(closed, "Closed all active files");
        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    /// Make sure new files never reuse the name of a file that is still
    /// waiting for upload, or that may already be in the remote store.
    pub async fn reserve_sequences(&self, files: &[ClosedFile]) {
        let mut table = self.table.lock().await;
        for file in files {
            let Some(sequence) = parse_sequence(&file.local_path) else {
                continue;
            };
            let next = table
                .sequences
                .entry(file.partition_key.clone())
                .or_insert(0);
            *next = (*next).max(sequence + 1);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.table.lock().await.active.len()
    }

    pub async fn active_partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self.table.lock().await.active.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn resolver(&self) -> &PartitionResolver {
        &self.resolver
    }

    /// Cancelled once a fatal error stopped the orchestrator
    pub fn halted(&self) -> CancellationToken {
        self.halted.clone()
    }

    /// Message of the fatal error that stopped the orchestrator, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    async fn open_writer(
        &self,
        key: &PartitionKey,
        sequences: &mut HashMap<PartitionKey, u64>,
    ) -> Result<LocalFileWriter> {
        let relative_dir = key.to_path();
        let sequence = sequences.entry(key.clone()).or_insert(0);

        loop {
            let name = file_name(&self.instance_id, *sequence, self.extension);
            let relative = relative_dir.join(&name);
            *sequence += 1;

            let opened = LocalFileWriter::open(
                self.base_dir.join(&relative),
                key.clone(),
                remote_key(&self.remote_prefix, &relative),
            )
            .await;

            match opened {
                Ok(writer) => return Ok(writer),
                // Left over from an earlier run and still awaiting upload
                Err(SinkError::LocalWrite { ref source, ref path })
                    if source.kind() == ErrorKind::AlreadyExists =>
                {
                    debug!(path = %path.display(), "File exists, trying next sequence");
                }
                Err(e) => return Err(self.latch(e)),
            }
        }
    }

    async fn rotate(
        &self,
        active: &mut HashMap<PartitionKey, LocalFileWriter>,
        key: &PartitionKey,
        reason: &'static str,
    ) -> Result<()> {
        let Some(mut writer) = active.remove(key) else {
            return Ok(());
        };

        let closed = writer.close().await.map_err(|e| self.latch(e))?;
        info!(
            partition = %key,
            reason,
            path = %closed.local_path.display(),
            size_bytes = closed.size_bytes,
            records = closed.record_count,
            "Rotated file"
        );

        self.uploads.enqueue(closed).map_err(|e| self.latch(e))
    }

    fn check_halted(&self) -> Result<()> {
        match self.fatal.lock().as_ref() {
            Some(message) => Err(SinkError::Halted(message.clone())),
            None => Ok(()),
        }
    }

    /// Remember the first fatal error so every later call refuses work
    fn latch(&self, err: SinkError) -> SinkError {
        if err.is_fatal() {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                error!(error = %err, "Fatal error, sink halted");
                *fatal = Some(err.to_string());
                self.halted.cancel();
            }
        }
        err
    }
}

/// Sequence number of a file named by [`file_name`]
fn parse_sequence(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileFormat, Granularity};
    use crate::offsets::TopicPartition;
    use crate::policy::{RecordCountPolicy, SizeBasedPolicy, TimeBasedPolicy};
    use crate::store::LocalObjectStore;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        base: PathBuf,
        remote: PathBuf,
        uploads: Arc<UploadManager>,
        orchestrator: Arc<WriterOrchestrator>,
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.local.base_dir = dir.path().join("buffer");
        config.local.file_format = FileFormat::Raw;
        config.local.instance_id = String::new();
        config.partitioning.granularity = Granularity::Hour;
        config.upload.initial_backoff_ms = 1;
        config.upload.max_backoff_ms = 1;
        config
    }

    fn harness(policies: RotationPolicySet) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let remote = dir.path().join("remote");
        let uploads = Arc::new(UploadManager::spawn(
            Arc::new(LocalObjectStore::new(&remote)),
            &config.upload,
        ));
        let orchestrator = Arc::new(
            WriterOrchestrator::with_policies(&config, policies, uploads.clone()).unwrap(),
        );
        Harness {
            base: config.local.base_dir.clone(),
            _dir: dir,
            remote,
            uploads,
            orchestrator,
        }
    }

    fn record(offset: i64, hour: u32, value: &'static [u8]) -> Record {
        Record::new("orders", 0, offset, value)
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 15, hour, 5, 0).unwrap())
    }

    #[tokio::test]
    async fn test_records_are_appended_in_order() {
        let h = harness(RotationPolicySet::new());
        for (offset, value) in [&b"a"[..], b"b", b"c"].into_iter().enumerate() {
            h.orchestrator.submit(record(offset as i64, 10, value)).await.unwrap();
        }
        assert_eq!(h.orchestrator.active_count().await, 1);

        let tp = TopicPartition::new("orders", 0);
        // Still buffered, nothing is committable past the first record
        assert_eq!(h.uploads.offsets().committable()[&tp], 0);

        let path = h.base.join("orders/dt=2024-01-15/hr=10/000000.bin");
        h.orchestrator.close_all().await.unwrap();
        h.uploads.shutdown(Duration::from_secs(5)).await;

        assert!(!path.exists());
        assert_eq!(h.uploads.offsets().committable()[&tp], 3);
        let uploaded = std::fs::read(h.remote.join("orders/dt=2024-01-15/hr=10/000000.bin")).unwrap();
        assert_eq!(uploaded, b"abc");
    }

    #[tokio::test]
    async fn test_size_rotation_keeps_triggering_record() {
        let h = harness(RotationPolicySet::new().with(SizeBasedPolicy::new(4)));
        h.orchestrator.submit(record(0, 10, b"aa")).await.unwrap();
        h.orchestrator.submit(record(1, 10, b"bbb")).await.unwrap();
        // Crossed the threshold, so the file was closed right away
        assert_eq!(h.orchestrator.active_count().await, 0);

        h.orchestrator.submit(record(2, 10, b"c")).await.unwrap();
        h.orchestrator.close_all().await.unwrap();
        let stats = h.uploads.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.succeeded, 2);

        let dir = h.remote.join("orders/dt=2024-01-15/hr=10");
        assert_eq!(std::fs::read(dir.join("000000.bin")).unwrap(), b"aabbb");
        assert_eq!(std::fs::read(dir.join("000001.bin")).unwrap(), b"c");
    }

    #[tokio::test]
    async fn test_partitions_get_separate_files() {
        let h = harness(RotationPolicySet::new());
        h.orchestrator.submit(record(0, 10, b"x")).await.unwrap();
        h.orchestrator.submit(record(1, 10, b"y")).await.unwrap();
        h.orchestrator.submit(record(2, 11, b"z")).await.unwrap();

        let partitions = h.orchestrator.active_partitions().await;
        assert_eq!(
            partitions.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            vec!["orders/dt=2024-01-15/hr=10", "orders/dt=2024-01-15/hr=11"]
        );

        assert_eq!(h.orchestrator.close_all().await.unwrap(), 2);
        h.uploads.shutdown(Duration::from_secs(5)).await;
        assert_eq!(
            std::fs::read(h.remote.join("orders/dt=2024-01-15/hr=10/000000.bin")).unwrap(),
            b"xy"
        );
        assert_eq!(
            std::fs::read(h.remote.join("orders/dt=2024-01-15/hr=11/000000.bin")).unwrap(),
            b"z"
        );
    }

    #[tokio::test]
    async fn test_existing_files_are_skipped() {
        let h = harness(RotationPolicySet::new());
        let dir = h.base.join("orders/dt=2024-01-15/hr=10");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("000000.bin"), b"left over").unwrap();

        h.orchestrator.submit(record(0, 10, b"new")).await.unwrap();
        h.orchestrator.close_all().await.unwrap();
        h.uploads.shutdown(Duration::from_secs(5)).await;

        assert_eq!(std::fs::read(dir.join("000000.bin")).unwrap(), b"left over");
        assert_eq!(
            std::fs::read(h.remote.join("orders/dt=2024-01-15/hr=10/000001.bin")).unwrap(),
            b"new"
        );
    }

    #[tokio::test]
    async fn test_reserved_sequences_are_not_reused() {
        let h = harness(RotationPolicySet::new());
        let key = PartitionKey::new(vec![
            "orders".into(),
            "dt=2024-01-15".into(),
            "hr=10".into(),
        ]);
        h.orchestrator
            .reserve_sequences(&[ClosedFile {
                local_path: h.base.join("orders/dt=2024-01-15/hr=10/000004.bin"),
                remote_path: "orders/dt=2024-01-15/hr=10/000004.bin".into(),
                partition_key: key,
                size_bytes: 1,
                record_count: 0,
                closed_at: Utc::now(),
            }])
            .await;

        h.orchestrator.submit(record(0, 10, b"x")).await.unwrap();
        h.orchestrator.close_all().await.unwrap();
        h.uploads.shutdown(Duration::from_secs(5)).await;
        assert!(h.remote.join("orders/dt=2024-01-15/hr=10/000005.bin").exists());
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence(Path::new("a/000012.jsonl")), Some(12));
        assert_eq!(
            parse_sequence(Path::new("a/20240115T100000-42-000003.bin")),
            Some(3)
        );
        assert_eq!(parse_sequence(Path::new("a/notes.txt")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_idle_files() {
        let h = harness(RotationPolicySet::new().with(TimeBasedPolicy::new(Duration::from_secs(60))));
        h.orchestrator.submit(record(0, 10, b"idle")).await.unwrap();

        assert_eq!(h.orchestrator.sweep().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(h.orchestrator.sweep().await.unwrap(), 1);
        assert_eq!(h.orchestrator.active_count().await, 0);

        let stats = h.uploads.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_file_rotates_before_append() {
        let h = harness(RotationPolicySet::new().with(TimeBasedPolicy::new(Duration::from_secs(60))));
        h.orchestrator.submit(record(0, 10, b"old")).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        h.orchestrator.submit(record(1, 10, b"new")).await.unwrap();

        h.orchestrator.close_all().await.unwrap();
        h.uploads.shutdown(Duration::from_secs(5)).await;
        let dir = h.remote.join("orders/dt=2024-01-15/hr=10");
        assert_eq!(std::fs::read(dir.join("000000.bin")).unwrap(), b"old");
        assert_eq!(std::fs::read(dir.join("000001.bin")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_sweep_ignores_size_only_policies() {
        let h = harness(RotationPolicySet::new().with(RecordCountPolicy::new(10)));
        h.orchestrator.submit(record(0, 10, b"x")).await.unwrap();
        assert_eq!(h.orchestrator.sweep().await.unwrap(), 0);
        assert_eq!(h.orchestrator.active_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sweep_and_submit_lose_nothing() {
        let h = harness(RotationPolicySet::new().with(TimeBasedPolicy::new(Duration::ZERO)));

        let sweeper = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    orchestrator.sweep().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for offset in 0..200 {
            h.orchestrator.submit(record(offset, 10, b"r")).await.unwrap();
        }
        sweeper.await.unwrap();
        h.orchestrator.close_all().await.unwrap();
        let stats = h.uploads.shutdown(Duration::from_secs(30)).await;
        assert_eq!(stats.failed_terminal, 0);

        let total: usize = std::fs::read_dir(h.remote.join("orders/dt=2024-01-15/hr=10"))
            .unwrap()
            .map(|entry| std::fs::read(entry.unwrap().path()).unwrap().len())
            .sum();
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn test_local_write_failure_halts() {
        let h = harness(RotationPolicySet::new());
        std::fs::create_dir_all(&h.base).unwrap();
        // A plain file where the topic directory should go
        std::fs::write(h.base.join("orders"), b"").unwrap();

        let halted = h.orchestrator.halted();
        let err = h.orchestrator.submit(record(0, 10, b"x")).await.unwrap_err();
        assert!(matches!(err, SinkError::LocalWrite { .. }));
        assert!(halted.is_cancelled());
        assert!(h.orchestrator.fatal_error().is_some());

        let err = h.orchestrator.submit(record(1, 10, b"y")).await.unwrap_err();
        assert!(matches!(err, SinkError::Halted(_)));
        assert!(matches!(h.orchestrator.sweep().await, Err(SinkError::Halted(_))));
    }

    #[tokio::test]
    async fn test_invalid_json_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.local.file_format = FileFormat::JsonLines;
        let uploads = Arc::new(UploadManager::spawn(
            Arc::new(LocalObjectStore::new(dir.path().join("remote"))),
            &config.upload,
        ));
        let orchestrator = WriterOrchestrator::new(&config, uploads).unwrap();

        let err = orchestrator.submit(record(0, 10, b"not json")).await.unwrap_err();
        assert!(matches!(err, SinkError::Deserialize(_)));
        orchestrator.submit(record(1, 10, br#"{"ok":true}"#)).await.unwrap();
        assert!(orchestrator.fatal_error().is_none());
    }
}
