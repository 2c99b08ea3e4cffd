//! Upload manager: moves closed local files to the remote object store.
//!
//! `enqueue` never blocks. A dispatcher task pulls queued files and starts one
//! worker per file, holding a semaphore permit so at most `concurrency` uploads
//! run at once; the rest wait in the queue. Each worker drives its own
//! [`UploadTask`] through the retry state machine:
//!
//! ```text
//! Pending -> InFlight -> Succeeded
//!               |  ^
//!               v  | (backoff)
//!        FailedRetryable -> FailedTerminal (ceiling reached or terminal error)
//! ```
//!
//! The local file is deleted only after the store confirmed the write. A
//! terminal failure leaves it on disk for an operator (or the next start's
//! recovery pass) to pick up.

use crate::config::UploadConfig;
use crate::error::{Result, SinkError, StoreError};
use crate::offsets::OffsetTracker;
use crate::store::ObjectStoreRef;
use crate::writer::ClosedFile;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of an upload task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

/// One closed file on its way to the remote store
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub file: ClosedFile,
    pub attempts: u32,
    pub status: UploadStatus,
}

impl UploadTask {
    pub fn new(file: ClosedFile) -> Self {
        Self {
            file,
            attempts: 0,
            status: UploadStatus::Pending,
        }
    }
}

/// A file that could not be uploaded and was left on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUpload {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub attempts: u32,
    pub error: String,
}

impl From<&FailedUpload> for SinkError {
    fn from(failed: &FailedUpload) -> Self {
        SinkError::UploadTerminal {
            path: failed.local_path.clone(),
            attempts: failed.attempts,
            message: failed.error.clone(),
        }
    }
}

/// Snapshot of upload counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub enqueued: u64,
    pub succeeded: u64,
    /// Attempts that failed and were retried
    pub retries: u64,
    pub failed_terminal: u64,
    /// Tasks dropped at shutdown because the grace period ran out
    pub abandoned: u64,
    pub failures: Vec<FailedUpload>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    succeeded: AtomicU64,
    retries: AtomicU64,
    failed_terminal: AtomicU64,
    abandoned: AtomicU64,
    failures: Mutex<Vec<FailedUpload>>,
}

impl Counters {
    fn snapshot(&self) -> UploadStats {
        UploadStats {
            enqueued: self.enqueued.load(Ordering::Acquire),
            succeeded: self.succeeded.load(Ordering::Acquire),
            retries: self.retries.load(Ordering::Acquire),
            failed_terminal: self.failed_terminal.load(Ordering::Acquire),
            abandoned: self.abandoned.load(Ordering::Acquire),
            failures: self.failures.lock().clone(),
        }
    }
}

/// Retry and timeout settings shared by all workers
#[derive(Debug, Clone)]
struct RetrySettings {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    attempt_timeout: Duration,
}

impl RetrySettings {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: self.multiplier,
            max_elapsed_time: None, // bounded by max_attempts instead
            ..ExponentialBackoff::default()
        }
    }
}

/// Handle to the background upload pool
pub struct UploadManager {
    tx: Mutex<Option<mpsc::UnboundedSender<UploadTask>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    offsets: Arc<OffsetTracker>,
    cancel: CancellationToken,
}

impl UploadManager {
    /// Spawn the dispatcher on the current runtime
    pub fn spawn(store: ObjectStoreRef, config: &UploadConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let offsets = Arc::new(OffsetTracker::new());
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let settings = RetrySettings {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            multiplier: config.backoff_multiplier,
            attempt_timeout: config.attempt_timeout(),
        };

        let dispatcher = tokio::spawn(dispatch(
            rx,
            store,
            Arc::new(Semaphore::new(config.concurrency.max(1))),
            settings,
            counters.clone(),
            offsets.clone(),
            cancel.clone(),
        ));

        info!(
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            "Upload manager started"
        );

        Self {
            tx: Mutex::new(Some(tx)),
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
            counters,
            offsets,
            cancel,
        }
    }

    /// Queue a closed file for upload. Returns immediately.
    pub fn enqueue(&self, file: ClosedFile) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(SinkError::UploadQueueClosed)?;

        debug!(
            path = %file.local_path.display(),
            remote_path = %file.remote_path,
            size_bytes = file.size_bytes,
            "Queued file for upload"
        );

        // Count first so a fast worker can never finish an uncounted task
        self.counters.enqueued.fetch_add(1, Ordering::AcqRel);
        if tx.send(UploadTask::new(file)).is_err() {
            self.counters.enqueued.fetch_sub(1, Ordering::AcqRel);
            return Err(SinkError::UploadQueueClosed);
        }
        Ok(())
    }

    pub fn stats(&self) -> UploadStats {
        self.counters.snapshot()
    }

    /// Offsets released as their files finish uploading
    pub fn offsets(&self) -> &Arc<OffsetTracker> {
        &self.offsets
    }

    /// Tasks enqueued but not yet finished
    pub fn pending(&self) -> u64 {
        let stats = self.stats();
        stats
            .enqueued
            .saturating_sub(stats.succeeded + stats.failed_terminal + stats.abandoned)
    }

    /// Stop accepting files and drain queued and in-flight uploads.
    ///
    /// Whatever is still unfinished when `grace` runs out is abandoned; its
    /// local file stays on disk.
    pub async fn shutdown(&self, grace: Duration) -> UploadStats {
        // Dropping the sender lets the dispatcher see the end of the queue
        drop(self.tx.lock().take());

        let mut dispatcher = self.dispatcher.lock().await;
        if let Some(mut handle) = dispatcher.take() {
            info!(pending = self.pending(), "Draining uploads");

            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Upload dispatcher failed"),
                Err(_) => {
                    warn!(
                        grace_secs = grace.as_secs_f64(),
                        "Upload drain exceeded grace period, abandoning remaining uploads"
                    );
                    self.cancel.cancel();
                    if let Err(e) = handle.await {
                        error!(error = %e, "Upload dispatcher failed");
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed_terminal,
            abandoned = stats.abandoned,
            "Upload manager stopped"
        );
        stats
    }
}

/// Pull tasks off the queue and run them under the concurrency limit
async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<UploadTask>,
    store: ObjectStoreRef,
    semaphore: Arc<Semaphore>,
    settings: RetrySettings,
    counters: Arc<Counters>,
    offsets: Arc<OffsetTracker>,
    cancel: CancellationToken,
) {
    let settings = Arc::new(settings);
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(joined) = workers.join_next(), if !workers.is_empty() => log_worker_exit(joined),

            next = rx.recv() => {
                let Some(task) = next else {
                    debug!(remaining = workers.len(), "Upload queue closed, draining workers");
                    break;
                };

                // Saturated pool: the task waits here, later ones wait in the queue
                let permit = tokio::select! {
                    _ = cancel.cancelled() => {
                        abandon(&counters, &task);
                        break;
                    }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            abandon(&counters, &task);
                            break;
                        }
                    },
                };

                workers.spawn(run_task(
                    task,
                    store.clone(),
                    settings.clone(),
                    counters.clone(),
                    offsets.clone(),
                    permit,
                ));
            }
        }
    }

    let mut aborted = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !aborted => {
                workers.abort_all();
                aborted = true;
            }
            joined = workers.join_next() => match joined {
                Some(joined) => {
                    if matches!(&joined, Err(e) if e.is_cancelled()) {
                        counters.abandoned.fetch_add(1, Ordering::AcqRel);
                    }
                    log_worker_exit(joined);
                }
                None => break,
            },
        }
    }

    // Anything still queued never started
    rx.close();
    while let Ok(task) = rx.try_recv() {
        abandon(&counters, &task);
    }
}

fn abandon(counters: &Counters, task: &UploadTask) {
    counters.abandoned.fetch_add(1, Ordering::AcqRel);
    warn!(
        path = %task.file.local_path.display(),
        "Upload abandoned at shutdown, file left on disk"
    );
}

fn log_worker_exit(joined: std::result::Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("Upload worker cancelled"),
        Err(e) => error!(error = %e, "Upload worker panicked"),
    }
}

/// Drive one task to `Succeeded` or `FailedTerminal`
#[instrument(skip_all, fields(path = %task.file.local_path.display(), remote_path = %task.file.remote_path))]
async fn run_task(
    mut task: UploadTask,
    store: ObjectStoreRef,
    settings: Arc<RetrySettings>,
    counters: Arc<Counters>,
    offsets: Arc<OffsetTracker>,
    _permit: OwnedSemaphorePermit,
) {
    let mut backoff = settings.backoff();

    loop {
        task.status = UploadStatus::InFlight;
        task.attempts += 1;

        match attempt(&store, &task.file, settings.attempt_timeout).await {
            Ok(()) => {
                task.status = UploadStatus::Succeeded;
                counters.succeeded.fetch_add(1, Ordering::AcqRel);
                offsets.release(&task.file.local_path);
                remove_local(&task.file).await;
                info!(
                    attempts = task.attempts,
                    size_bytes = task.file.size_bytes,
                    records = task.file.record_count,
                    "File uploaded"
                );
                return;
            }
            Err(e) if e.is_retryable() && task.attempts < settings.max_attempts => {
                task.status = UploadStatus::FailedRetryable;
                counters.retries.fetch_add(1, Ordering::AcqRel);
                let delay = backoff.next_backoff().unwrap_or(settings.max_backoff);
                warn!(
                    attempt = task.attempts,
                    max_attempts = settings.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Upload attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                task.status = UploadStatus::FailedTerminal;
                let failed = FailedUpload {
                    local_path: task.file.local_path.clone(),
                    remote_path: task.file.remote_path.clone(),
                    attempts: task.attempts,
                    error: e.to_string(),
                };
                error!(
                    error = %SinkError::from(&failed),
                    "Upload failed permanently, local file kept for recovery"
                );
                counters.failures.lock().push(failed);
                counters.failed_terminal.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }
    }
}

async fn attempt(
    store: &ObjectStoreRef,
    file: &ClosedFile,
    timeout: Duration,
) -> std::result::Result<(), StoreError> {
    let body = match tokio::fs::read(&file.local_path).await {
        Ok(body) => Bytes::from(body),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StoreError::Terminal(format!("local file missing: {}", e)))
        }
        Err(e) => return Err(StoreError::Retryable(format!("reading local file: {}", e))),
    };

    match tokio::time::timeout(timeout, store.put_object(&file.remote_path, body)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Retryable(format!(
            "attempt timed out after {:?}",
            timeout
        ))),
    }
}

async fn remove_local(file: &ClosedFile) {
    match tokio::fs::remove_file(&file.local_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        // The object is safe remotely; a leftover file is only re-uploaded on recovery
        Err(e) => warn!(
            path = %file.local_path.display(),
            error = %e,
            "Failed to delete uploaded local file"
        ),
    }
}
