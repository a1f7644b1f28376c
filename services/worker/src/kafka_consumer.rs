use crate::config::KafkaConfig;
use crate::ingest::{AckError, Acknowledger, IncomingMessage, Ingestor};
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Kafka consumer feeding uploaded video notifications to the ingestor
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    /// Create the consumer and subscribe to the configured topic
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = client_config(config)
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.topic])
            .context("Failed to subscribe to video topic")?;

        info!(
            topic = %config.topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
        })
    }

    /// Feed messages to `ingestor` until `shutdown` fires
    #[instrument(skip_all, fields(topic = %self.topic))]
    pub async fn run(&self, ingestor: &Ingestor, shutdown: CancellationToken) {
        let messages = self
            .consumer
            .stream()
            .map(|result| result.map(|message| incoming_message(&message)));

        ingestor.run(messages, self, shutdown).await;
    }
}

impl Acknowledger for KafkaSource {
    /// Commit the offset after `message` for its partition
    fn acknowledge(&self, message: &IncomingMessage) -> Result<(), AckError> {
        let ack_error = |reason: String| AckError {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            reason,
        };

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
            .map_err(|e| ack_error(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| ack_error(e.to_string()))
    }
}

fn client_config(config: &KafkaConfig) -> ClientConfig {
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

    if let (Some(ref username), Some(ref password)) = (&config.sasl_username, &config.sasl_password) {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client_config
}

fn incoming_message<M: Message>(message: &M) -> IncomingMessage {
    IncomingMessage {
        payload: message.payload().map(<[u8]>::to_vec),
        key: message.key().map(<[u8]>::to_vec),
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
    }
}
