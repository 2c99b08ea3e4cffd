//! Kafka source: feeds broker messages into the sink and commits uploaded offsets.

use crate::config::KafkaConfig;
use crate::error::SinkError;
use crate::message::{decode_headers, IncomingMessage, MessageMetadata};
use crate::offsets::TopicPartition;
use crate::sink::ObjectStorageSink;
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Kafka consumer draining the configured topics into the sink
pub struct KafkaSource {
    consumer: StreamConsumer,
    sink: Arc<ObjectStorageSink>,
    commit_interval: Duration,
    committed: BTreeMap<TopicPartition, i64>,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig, sink: Arc<ObjectStorageSink>) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .context("Failed to subscribe to topics")?;

        info!(
            topics = ?config.topics,
            group = %config.consumer_group,
            "Subscribed to Kafka topics"
        );

        Ok(Self {
            consumer,
            sink,
            commit_interval: config.commit_interval(),
            committed: BTreeMap::new(),
        })
    }

    /// Consume until `shutdown` is cancelled or the sink halts.
    ///
    /// Invalid payloads are logged and skipped. A fatal sink error ends the
    /// loop and is returned.
    #[instrument(skip_all)]
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting Kafka source");

        let halted = self.sink.halted();
        let mut commit_ticker = tokio::time::interval(self.commit_interval);
        commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let consumer = &self.consumer;
        let sink = &self.sink;
        let mut stream = consumer.stream();
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = halted.cancelled() => {
                    let message = sink.fatal_error().unwrap_or_default();
                    outcome = Err(SinkError::Halted(message).into());
                    break;
                }
                _ = commit_ticker.tick() => {
                    commit(consumer, &mut self.committed, sink.committable_offsets());
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        if let Err(e) = forward(sink, &message).await {
                            if e.is_fatal() {
                                outcome = Err(e.into());
                                break;
                            }
                            warn!(
                                error = %e,
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                "Skipping message"
                            );
                        }
                    }
                    Some(Err(e)) => error!(error = %e, "Kafka consumer error"),
                    None => break,
                },
            }
        }

        info!("Kafka source stopped");
        outcome
    }

    /// Commit whatever finished uploading. Call after the sink shut down.
    pub fn commit_uploaded(&mut self) {
        let offsets = self.sink.committable_offsets();
        commit(&self.consumer, &mut self.committed, offsets);
    }
}

async fn forward(sink: &ObjectStorageSink, message: &BorrowedMessage<'_>) -> crate::Result<()> {
    sink.push(to_incoming(message)).await
}

fn to_incoming(message: &BorrowedMessage<'_>) -> IncomingMessage {
    let headers = message
        .headers()
        .map(|headers| decode_headers(headers.iter().map(|h| (h.key, h.value))))
        .unwrap_or_default();

    IncomingMessage {
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        metadata: MessageMetadata {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            timestamp: message.timestamp().to_millis(),
            headers,
        },
    }
}

/// Commit offsets that moved since the last commit
fn commit(
    consumer: &StreamConsumer,
    committed: &mut BTreeMap<TopicPartition, i64>,
    offsets: BTreeMap<TopicPartition, i64>,
) {
    let advanced: Vec<(TopicPartition, i64)> = offsets
        .into_iter()
        .filter(|(tp, offset)| committed.get(tp).map_or(true, |last| offset > last))
        .collect();
    if advanced.is_empty() {
        return;
    }

    let mut list = TopicPartitionList::new();
    for (tp, offset) in &advanced {
        if let Err(e) = list.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))
        {
            warn!(partition = %tp, error = %e, "Invalid commit offset");
        }
    }

    match consumer.commit(&list, CommitMode::Async) {
        Ok(()) => {
            debug!(partitions = advanced.len(), "Committed uploaded offsets");
            committed.extend(advanced);
        }
        Err(e) => warn!(error = %e, "Failed to commit offsets"),
    }
}
