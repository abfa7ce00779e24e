use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};

use crate::error::ApiError;

use super::{RelayEnvelope, RelayProducer, RelayRecord, RelaySource};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka producer for the relay topic.
pub struct KafkaRelayProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaRelayProducer {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, ApiError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", "murmur-gateway")
            .set("message.timeout.ms", "10000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

/// Records are keyed by chat id so one chat stays on one partition, in order.
fn relay_record<'a>(
    topic: &'a str,
    envelope: &'a RelayEnvelope,
    payload: &'a str,
) -> FutureRecord<'a, str, str> {
    FutureRecord::to(topic)
        .key(envelope.chat_id.as_str())
        .payload(payload)
}

#[async_trait]
impl RelayProducer for KafkaRelayProducer {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), ApiError> {
        let payload = serde_json::to_string(envelope)?;
        let record = relay_record(&self.topic, envelope, &payload);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(err, _)| ApiError::from(err))?;
        Ok(())
    }
}

/// Kafka consumer in the shared relay group, with manual offset commits.
pub struct KafkaRelaySource {
    consumer: StreamConsumer,
}

impl KafkaRelaySource {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self, ApiError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("client.id", "murmur-gateway")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "10000")
            .create()?;
        consumer.subscribe(&[topic])?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl RelaySource for KafkaRelaySource {
    async fn recv(&mut self) -> Result<Option<RelayRecord>, ApiError> {
        let message = self.consumer.recv().await?;
        Ok(Some(RelayRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    async fn commit(&mut self, record: &RelayRecord) -> Result<(), ApiError> {
        // Kafka commits the offset of the next record to read.
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}
