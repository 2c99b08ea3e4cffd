//! Broker message model and the record encoding written to buffered files.
//!
//! [`MessageDeserializer`] turns a raw broker message into a [`Record`]. The
//! orchestrator then asks a [`RecordEncoder`] for the exact bytes to append to
//! the partition file, optionally enriched with broker metadata.

use crate::config::{FileFormat, LocalConfig};
use crate::error::{Result, SinkError};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Metadata about a received message
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in epoch milliseconds
    pub timestamp: Option<i64>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

/// Collect broker headers into a string map. Headers without a value or with
/// a non-UTF-8 value are skipped.
pub fn decode_headers<'a, I>(headers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, Option<&'a [u8]>)>,
{
    headers
        .into_iter()
        .filter_map(|(key, value)| {
            let value = String::from_utf8(value?.to_vec()).ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}

/// A decoded broker record. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker timestamp; `None` when the broker did not provide one
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
            topic: topic.into(),
            partition,
            offset,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Converts broker messages into records, validating the payload for the
/// configured file format.
#[derive(Debug, Clone)]
pub struct MessageDeserializer {
    format: FileFormat,
}

impl MessageDeserializer {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    pub fn deserialize(&self, message: IncomingMessage) -> Result<Record> {
        let IncomingMessage { payload, metadata } = message;

        if self.format == FileFormat::JsonLines {
            serde_json::from_slice::<Value>(&payload).map_err(|e| {
                SinkError::Deserialize(format!(
                    "{}[{}]@{}: {}",
                    metadata.topic, metadata.partition, metadata.offset, e
                ))
            })?;
        }

        Ok(Record {
            key: metadata.key.map(Bytes::from),
            value: Bytes::from(payload),
            topic: metadata.topic,
            partition: metadata.partition,
            offset: metadata.offset,
            timestamp: metadata.timestamp.and_then(DateTime::from_timestamp_millis),
        })
    }
}

/// Produces the bytes appended to a partition file for one record
#[derive(Debug, Clone)]
pub struct RecordEncoder {
    format: FileFormat,
    include_metadata: bool,
    metadata_column: Option<String>,
}

impl RecordEncoder {
    pub fn new(config: &LocalConfig) -> Self {
        let metadata_column = Some(config.metadata_column.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Self {
            format: config.file_format,
            include_metadata: config.include_metadata,
            metadata_column,
        }
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Encode a record, stamping `load_time` with the current wall clock
    pub fn encode(&self, record: &Record) -> Result<Vec<u8>> {
        self.encode_at(record, Utc::now())
    }

    pub fn encode_at(&self, record: &Record, load_time: DateTime<Utc>) -> Result<Vec<u8>> {
        match self.format {
            FileFormat::Raw => Ok(record.value.to_vec()),
            FileFormat::JsonLines => {
                let value: Value = serde_json::from_slice(&record.value).map_err(|e| {
                    SinkError::Deserialize(format!(
                        "{}[{}]@{}: {}",
                        record.topic, record.partition, record.offset, e
                    ))
                })?;

                let value = if self.include_metadata {
                    self.enrich(value, record, load_time)
                } else {
                    value
                };

                let mut line = serde_json::to_vec(&value)
                    .map_err(|e| SinkError::Deserialize(e.to_string()))?;
                line.push(b'\n');
                Ok(line)
            }
        }
    }

    fn enrich(&self, value: Value, record: &Record, load_time: DateTime<Utc>) -> Value {
        let metadata = metadata_fields(record, load_time);

        match (&self.metadata_column, value) {
            (Some(column), Value::Object(mut object)) => {
                object.insert(column.clone(), Value::Object(metadata));
                Value::Object(object)
            }
            (None, Value::Object(mut object)) => {
                object.extend(metadata);
                Value::Object(object)
            }
            // Non-object payloads are wrapped so the metadata has somewhere to live
            (column, other) => {
                let mut object = Map::new();
                object.insert("value".to_string(), other);
                match column {
                    Some(column) => {
                        object.insert(column.clone(), Value::Object(metadata));
                    }
                    None => object.extend(metadata),
                }
                Value::Object(object)
            }
        }
    }
}

fn metadata_fields(record: &Record, load_time: DateTime<Utc>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("message_offset".into(), Value::from(record.offset));
    fields.insert("message_partition".into(), Value::from(record.partition));
    fields.insert("message_topic".into(), Value::from(record.topic.clone()));
    fields.insert(
        "message_timestamp".into(),
        record
            .timestamp
            .map(|ts| Value::from(ts.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .unwrap_or(Value::Null),
    );
    fields.insert(
        "load_time".into(),
        Value::from(load_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn incoming(payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            payload: payload.to_vec(),
            metadata: MessageMetadata {
                topic: "orders".to_string(),
                partition: 3,
                offset: 42,
                key: Some(b"order-1".to_vec()),
                timestamp: Some(1_705_314_645_000),
                headers: HashMap::new(),
            },
        }
    }

    fn encoder(include_metadata: bool, column: &str) -> RecordEncoder {
        RecordEncoder::new(&LocalConfig {
            include_metadata,
            metadata_column: column.to_string(),
            ..LocalConfig::default()
        })
    }

    #[test]
    fn test_deserialize_carries_broker_metadata() {
        let record = MessageDeserializer::new(FileFormat::JsonLines)
            .deserialize(incoming(br#"{"id":1}"#))
            .unwrap();

        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, 3);
        assert_eq!(record.offset, 42);
        assert_eq!(record.key.as_deref(), Some(&b"order-1"[..]));
        assert_eq!(
            record.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap())
        );
    }

    #[test]
    fn test_deserialize_rejects_invalid_json() {
        let result = MessageDeserializer::new(FileFormat::JsonLines).deserialize(incoming(b"not json"));
        assert!(matches!(result, Err(SinkError::Deserialize(_))));

        // Raw format accepts anything
        assert!(MessageDeserializer::new(FileFormat::Raw)
            .deserialize(incoming(b"not json"))
            .is_ok());
    }

    #[test]
    fn test_encode_raw_is_verbatim() {
        let encoder = RecordEncoder::new(&LocalConfig {
            file_format: FileFormat::Raw,
            ..LocalConfig::default()
        });
        let record = Record::new("orders", 0, 0, &b"\x00\x01binary"[..]);
        assert_eq!(encoder.encode(&record).unwrap(), b"\x00\x01binary".to_vec());
    }

    #[test]
    fn test_encode_json_line_without_metadata() {
        let record = Record::new("orders", 0, 7, &br#"{"id": 1}"#[..]);
        let line = encoder(false, "").encode(&record).unwrap();
        assert_eq!(line, b"{\"id\":1}\n".to_vec());
    }

    #[test]
    fn test_encode_flat_metadata() {
        let load_time = Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap();
        let record = Record::new("orders", 2, 7, &br#"{"id": 1}"#[..]);
        let line = encoder(true, "").encode_at(&record, load_time).unwrap();
        let value: Value = serde_json::from_slice(&line).unwrap();

        assert_eq!(value["id"], 1);
        assert_eq!(value["message_topic"], "orders");
        assert_eq!(value["message_partition"], 2);
        assert_eq!(value["message_offset"], 7);
        assert_eq!(value["message_timestamp"], Value::Null);
        assert_eq!(value["load_time"], "2024-01-15T11:00:00.000Z");
    }

    #[test]
    fn test_encode_nested_metadata() {
        let record = Record::new("orders", 2, 7, &br#"{"id": 1}"#[..]);
        let line = encoder(true, "kafka").encode(&record).unwrap();
        let value: Value = serde_json::from_slice(&line).unwrap();

        assert_eq!(value["id"], 1);
        assert_eq!(value["kafka"]["message_offset"], 7);
        assert!(value.get("message_offset").is_none());
    }

    #[test]
    fn test_encode_wraps_scalar_payload() {
        let record = Record::new("orders", 0, 1, &b"17"[..]);
        let line = encoder(true, "").encode(&record).unwrap();
        let value: Value = serde_json::from_slice(&line).unwrap();

        assert_eq!(value["value"], 17);
        assert_eq!(value["message_offset"], 1);
    }

    #[test]
    fn test_decode_headers_skips_empty_and_binary_values() {
        let raw: Vec<(&str, Option<&[u8]>)> = vec![
            ("trace-id", Some(&b"abc123"[..])),
            ("tombstone", None),
            ("blob", Some(&[0xff, 0xfe, 0x00][..])),
            ("source", Some(&b"orders-api"[..])),
        ];

        let headers = decode_headers(raw);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["trace-id"], "abc123");
        assert_eq!(headers["source"], "orders-api");
        assert!(!headers.contains_key("blob"));
    }
}
