//! Kafka feed subscription.
//!
//! Wraps an rdkafka `BaseConsumer`, whose `poll` blocks the calling thread,
//! so it is driven from the stream consumer's worker thread rather than the
//! async scheduler.
//!
//! Offsets are stored only through the subscription's acknowledger, so
//! records that were pulled but never handled are not committed.

use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as KafkaMessage;
use rdkafka::ClientConfig;
use tracing::{debug, info};

use super::{
    Acknowledger, FeedError, FeedMessage, FeedPosition, FeedSource, KafkaConfig, Result,
    Subscription,
};

impl KafkaConfig {
    /// Build a ClientConfig for the feed consumer.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", &self.group_id);
        config.set("auto.offset.reset", &self.auto_offset_reset);
        config.set("enable.auto.commit", "true");
        config.set("enable.auto.offset.store", "false");
        config.set("session.timeout.ms", "10000");
        config.set("fetch.wait.max.ms", "500");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for the timeline producer.
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }

        if let Some(ref cert_location) = self.ssl_certificate_location {
            config.set("ssl.certificate.location", cert_location);
        }

        if let Some(ref key_location) = self.ssl_key_location {
            config.set("ssl.key.location", key_location);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }
    }
}

/// Feed backed by a Kafka cluster.
pub struct KafkaFeed {
    config: KafkaConfig,
}

impl KafkaFeed {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

impl FeedSource for KafkaFeed {
    fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        let consumer: BaseConsumer = self
            .config
            .build_consumer_config()
            .create()
            .map_err(|e| FeedError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| FeedError::Subscribe(format!("Failed to subscribe to {}: {}", topic, e)))?;

        info!(
            bootstrap_servers = %self.config.bootstrap_servers,
            group_id = %self.config.group_id,
            topic = %topic,
            "Subscribed to Kafka topic"
        );

        let consumer = Arc::new(consumer);
        Ok(Box::new(KafkaSubscription {
            acknowledger: Arc::new(KafkaAcknowledger {
                consumer: Arc::clone(&consumer),
            }),
            consumer: Some(consumer),
        }))
    }
}

struct KafkaSubscription {
    consumer: Option<Arc<BaseConsumer>>,
    acknowledger: Arc<KafkaAcknowledger>,
}

impl Subscription for KafkaSubscription {
    fn poll(&mut self, timeout: Duration) -> Result<Option<FeedMessage>> {
        let consumer = self.consumer.as_ref().ok_or(FeedError::Closed)?;

        match consumer.poll(timeout) {
            None => Ok(None),
            Some(Ok(message)) => {
                debug!(
                    topic = %message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "Received feed record"
                );
                let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                Ok(Some(FeedMessage::new(
                    message.topic(),
                    message.partition(),
                    message.offset(),
                    payload,
                )))
            }
            Some(Err(KafkaError::PartitionEOF(partition))) => {
                debug!(partition, "Reached end of partition");
                Ok(None)
            }
            Some(Err(e)) => Err(FeedError::Receive(e.to_string())),
        }
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
                debug!(error = %e, "No stored offsets committed on close");
            }
            consumer.unsubscribe();
            info!("Kafka subscription closed");
        }
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        self.acknowledger.clone()
    }
}

/// Stores the offset after each handled record for the next auto-commit.
struct KafkaAcknowledger {
    consumer: Arc<BaseConsumer>,
}

impl Acknowledger for KafkaAcknowledger {
    fn acknowledge(&self, position: &FeedPosition) -> Result<()> {
        self.consumer
            .store_offset(&position.topic, position.partition, position.offset + 1)
            .map_err(|e| FeedError::Acknowledge(e.to_string()))
    }
}
