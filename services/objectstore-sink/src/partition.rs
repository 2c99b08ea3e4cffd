//! Partition key resolution.
//!
//! A record's partition is a list of path segments derived from its topic, a
//! fixed prefix and its time bucket, e.g. `orders/dt=2024-01-15/hr=10`. The
//! bucket comes from the broker timestamp or a payload field; when neither is
//! usable the processing time is used instead and a counter is bumped.

use crate::config::{Granularity, PartitioningConfig, TimestampSource};
use crate::error::{Result, SinkError};
use crate::message::Record;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Epoch values at or above this are taken as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Ordered path segments identifying one partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    segments: Vec<String>,
}

impl PartitionKey {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Relative directory of the partition
    pub fn to_path(&self) -> PathBuf {
        self.segments.iter().collect()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Maps records to partition keys
#[derive(Debug)]
pub struct PartitionResolver {
    config: PartitioningConfig,
    timezone: Tz,
    /// JSON pointer built from the dotted `timestamp_field`
    field_pointer: String,
    fallback_count: AtomicU64,
}

impl PartitionResolver {
    pub fn new(config: &PartitioningConfig) -> Result<Self> {
        let timezone = config.time_zone()?;

        if StrftimeItems::new(&config.date_pattern).any(|item| matches!(item, Item::Error)) {
            return Err(SinkError::Config(format!(
                "invalid date pattern {:?}",
                config.date_pattern
            )));
        }

        let field_pointer = config
            .timestamp_field
            .split('.')
            .fold(String::new(), |mut pointer, part| {
                pointer.push('/');
                pointer.push_str(part);
                pointer
            });

        Ok(Self {
            config: config.clone(),
            timezone,
            field_pointer,
            fallback_count: AtomicU64::new(0),
        })
    }

    /// Resolve a record, falling back to the current wall clock
    pub fn resolve(&self, record: &Record) -> PartitionKey {
        self.resolve_at(record, Utc::now())
    }

    /// Resolve a record, using `now` as the processing time fallback
    pub fn resolve_at(&self, record: &Record, now: DateTime<Utc>) -> PartitionKey {
        let mut segments: Vec<String> = self
            .config
            .prefix
            .iter()
            .map(|s| sanitize_path_component(s))
            .collect();

        if self.config.include_topic {
            segments.push(sanitize_path_component(&record.topic));
        }

        if self.config.granularity == Granularity::None {
            return PartitionKey::new(segments);
        }

        let instant = match self.event_time(record) {
            Some(instant) => instant,
            None => {
                self.fallback_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "No usable event time, partitioning by processing time"
                );
                now
            }
        };

        let local = instant.with_timezone(&self.timezone);
        let date = local.format(&self.config.date_pattern).to_string();
        segments.extend(
            format!("{}{}", self.config.date_prefix, date)
                .split('/')
                .filter(|s| !s.is_empty())
                .map(sanitize_path_component),
        );

        if self.config.granularity == Granularity::Hour {
            segments.push(sanitize_path_component(&format!(
                "{}{:02}",
                self.config.hour_prefix,
                local.hour()
            )));
        }

        PartitionKey::new(segments)
    }

    /// Number of records partitioned by processing time so far
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    fn event_time(&self, record: &Record) -> Option<DateTime<Utc>> {
        match self.config.timestamp_source {
            TimestampSource::Broker => record.timestamp,
            TimestampSource::Payload => {
                let payload: Value = serde_json::from_slice(&record.value).ok()?;
                parse_timestamp(payload.pointer(&self.field_pointer)?)
            }
        }
    }
}

/// Accepts RFC 3339 strings, epoch seconds/millis and `{seconds, nanos}` objects
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let n = n.as_i64()?;
            if n.abs() >= EPOCH_MILLIS_THRESHOLD {
                DateTime::from_timestamp_millis(n)
            } else {
                DateTime::from_timestamp(n, 0)
            }
        }
        Value::Object(fields) => {
            let seconds = fields.get("seconds")?.as_i64()?;
            let nanos = fields.get("nanos").and_then(Value::as_u64).unwrap_or(0);
            DateTime::from_timestamp(seconds, u32::try_from(nanos).ok()?)
        }
        _ => None,
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    if component == "." || component == ".." {
        return "_".repeat(component.len());
    }

    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '=' => c,
            _ => '_',
        })
        .collect()
}
