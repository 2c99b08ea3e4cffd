//! File rotation policies.
//!
//! Every policy is evaluated independently and a writer rotates as soon as any
//! of them fires. Only policies that depend on the passage of time take part in
//! the background sweep; the rest are checked after each append.

use crate::config::RotationConfig;
use crate::writer::WriterStats;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Decides whether an open file must stop accepting writes
pub trait RotationPolicy: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn should_rotate(&self, stats: &WriterStats, now: Instant) -> bool;

    /// Whether the policy can fire without new records arriving
    fn applies_to_sweep(&self) -> bool {
        false
    }
}

/// Rotates once the file holds at least `max_bytes`
#[derive(Debug, Clone)]
pub struct SizeBasedPolicy {
    max_bytes: u64,
}

impl SizeBasedPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl RotationPolicy for SizeBasedPolicy {
    fn name(&self) -> &'static str {
        "size"
    }

    fn should_rotate(&self, stats: &WriterStats, _now: Instant) -> bool {
        stats.bytes_written >= self.max_bytes
    }
}

/// Rotates once the file has been open for `max_age`
#[derive(Debug, Clone)]
pub struct TimeBasedPolicy {
    max_age: Duration,
}

impl TimeBasedPolicy {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

impl RotationPolicy for TimeBasedPolicy {
    fn name(&self) -> &'static str {
        "time"
    }

    fn should_rotate(&self, stats: &WriterStats, now: Instant) -> bool {
        now.saturating_duration_since(stats.opened_at) >= self.max_age
    }

    fn applies_to_sweep(&self) -> bool {
        true
    }
}

/// Rotates once the file holds `max_records` records
#[derive(Debug, Clone)]
pub struct RecordCountPolicy {
    max_records: u64,
}

impl RecordCountPolicy {
    pub fn new(max_records: u64) -> Self {
        Self { max_records }
    }
}

impl RotationPolicy for RecordCountPolicy {
    fn name(&self) -> &'static str {
        "record_count"
    }

    fn should_rotate(&self, stats: &WriterStats, _now: Instant) -> bool {
        stats.record_count >= self.max_records
    }
}

/// The set of policies guarding every writer
#[derive(Debug, Default)]
pub struct RotationPolicySet {
    policies: Vec<Box<dyn RotationPolicy>>,
}

impl RotationPolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl RotationPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    pub fn from_config(config: &RotationConfig) -> Self {
        let set = Self::new()
            .with(TimeBasedPolicy::new(config.max_file_age()))
            .with(SizeBasedPolicy::new(config.max_file_size_bytes));

        match config.max_records {
            Some(max_records) => set.with(RecordCountPolicy::new(max_records)),
            None => set,
        }
    }

    pub fn should_rotate(&self, stats: &WriterStats, now: Instant) -> bool {
        self.triggered(stats, now).is_some()
    }

    /// Name of the first policy that fires, if any
    pub fn triggered(&self, stats: &WriterStats, now: Instant) -> Option<&'static str> {
        self.policies
            .iter()
            .find(|p| p.should_rotate(stats, now))
            .map(|p| p.name())
    }

    /// Like [`triggered`](Self::triggered) but restricted to sweep policies
    pub fn triggered_on_sweep(&self, stats: &WriterStats, now: Instant) -> Option<&'static str> {
        self.policies
            .iter()
            .filter(|p| p.applies_to_sweep())
            .find(|p| p.should_rotate(stats, now))
            .map(|p| p.name())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
