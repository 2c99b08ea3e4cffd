//! Tracks which broker offsets are safe to commit.
//!
//! A record only counts as delivered once the file holding it was uploaded.
//! For each topic-partition the committable offset is the lowest offset still
//! sitting in an open or uploading file, or one past the highest buffered
//! offset when nothing is outstanding.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    /// Lowest offset per topic-partition in each file not yet uploaded
    pending: HashMap<PathBuf, HashMap<TopicPartition, i64>>,
    highest: HashMap<TopicPartition, i64>,
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    ledger: Mutex<Ledger>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `offset` of `topic`/`partition` was appended to `file`
    pub fn record(&self, file: &Path, topic: &str, partition: i32, offset: i64) {
        let mut ledger = self.ledger.lock();
        let tp = TopicPartition::new(topic, partition);

        let highest = ledger.highest.entry(tp.clone()).or_insert(offset);
        *highest = (*highest).max(offset);

        ledger
            .pending
            .entry(file.to_path_buf())
            .or_default()
            .entry(tp)
            .and_modify(|o| *o = (*o).min(offset))
            .or_insert(offset);
    }

    /// The file reached the remote store; its records no longer hold commits back
    pub fn release(&self, file: &Path) {
        self.ledger.lock().pending.remove(file);
    }

    /// Next offset to consume per topic-partition, as a broker commit expects
    pub fn committable(&self) -> BTreeMap<TopicPartition, i64> {
        let ledger = self.ledger.lock();

        ledger
            .highest
            .iter()
            .map(|(tp, highest)| {
                let floor = ledger
                    .pending
                    .values()
                    .filter_map(|lowest| lowest.get(tp).copied())
                    .min();
                (tp.clone(), floor.unwrap_or(highest + 1))
            })
            .collect()
    }

    /// Files holding records that have not been uploaded yet
    pub fn pending_files(&self) -> usize {
        self.ledger.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_waits_for_upload() {
        let tracker = OffsetTracker::new();
        let first = Path::new("/buf/orders/000000.jsonl");
        let second = Path::new("/buf/orders/000001.jsonl");

        tracker.record(first, "orders", 0, 10);
        tracker.record(first, "orders", 0, 11);
        tracker.record(second, "orders", 0, 12);
        tracker.record(second, "orders", 1, 5);

        let committable = tracker.committable();
        assert_eq!(committable[&TopicPartition::new("orders", 0)], 10);
        assert_eq!(committable[&TopicPartition::new("orders", 1)], 5);

        // Uploads can finish out of order
        tracker.release(second);
        let committable = tracker.committable();
        assert_eq!(committable[&TopicPartition::new("orders", 0)], 10);
        assert_eq!(committable[&TopicPartition::new("orders", 1)], 6);

        tracker.release(first);
        assert_eq!(tracker.committable()[&TopicPartition::new("orders", 0)], 13);
        assert_eq!(tracker.pending_files(), 0);
    }

    #[test]
    fn test_empty_tracker_commits_nothing() {
        assert!(OffsetTracker::new().committable().is_empty());
    }
}
