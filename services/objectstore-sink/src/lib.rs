//! Object Storage Sink
//!
//! Drains broker records into object storage through a local-disk buffer.
//! Records are routed to time-partitioned local files, files are rotated by
//! size, age, or record count, and closed files are uploaded in the
//! background with bounded concurrency and retries. A local file is deleted
//! only after the store acknowledged it, so anything left on disk after a
//! crash is uploaded again on the next start.
//!
//! ## Features
//!
//! - **Time Partitioning**: `{prefix}/{topic}/dt={date}/hr={hour}` keys from
//!   broker or payload timestamps, in any IANA time zone
//! - **Composable Rotation**: size, age, and record-count policies combined
//!   with logical OR; a periodic sweep flushes idle partitions
//! - **Reliable Uploads**: exponential backoff, per-attempt timeouts,
//!   retryable vs terminal classification, S3 multipart for large files
//! - **Safe Commits**: broker offsets become committable only once their file
//!   reached the store
//!
//! ## Architecture
//!
//! ```text
//!  Kafka Topics          Local Disk                       Object Store
//! ┌──────────────┐      ┌──────────────────────┐         ┌──────────────┐
//! │ Records      │      │ {topic}/dt=/hr=/     │         │ {prefix}/    │
//! └──────────────┘      │   000000.jsonl       │         │   {topic}/   │
//!        │              └──────────────────────┘         │   dt=/hr=/   │
//!        ▼                    ▲          │               └──────────────┘
//! ┌──────────────┐            │          │ closed files         ▲
//! │ Partition    │     ┌──────────────┐  ▼                      │
//! │ Resolver     │────▶│ Writer       │ ┌──────────────┐       │
//! └──────────────┘     │ Orchestrator │ │ Upload       │───────┘
//!                      └──────────────┘ │ Manager      │
//!                            ▲          └──────────────┘
//!                            │                 │
//!                      ┌──────────────┐        ▼
//!                      │ Rotation     │ ┌──────────────┐
//!                      │ Policies     │ │ Offset       │
//!                      └──────────────┘ │ Tracker      │
//!                                       └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod offsets;
pub mod orchestrator;
pub mod partition;
pub mod policy;
pub mod sink;
#[cfg(feature = "kafka")]
pub mod source;
pub mod store;
pub mod upload;
pub mod writer;

pub use config::Config;
pub use error::{Result, SinkError, StoreError};
pub use message::{IncomingMessage, MessageDeserializer, MessageMetadata, Record, RecordEncoder};
pub use offsets::{OffsetTracker, TopicPartition};
pub use orchestrator::WriterOrchestrator;
pub use partition::{PartitionKey, PartitionResolver};
pub use policy::{
    RecordCountPolicy, RotationPolicy, RotationPolicySet, SizeBasedPolicy, TimeBasedPolicy,
};
pub use sink::ObjectStorageSink;
pub use store::{LocalObjectStore, ObjectStore, ObjectStoreRef, S3ObjectStore};
pub use upload::{FailedUpload, UploadManager, UploadStats, UploadStatus, UploadTask};
pub use writer::{ClosedFile, LocalFileWriter, WriterStats};
