//! Kafka timeline publisher.
//!
//! Events are produced to the configured timeline topic, keyed by map id so
//! a map's events stay ordered within a partition. The delivery future is
//! awaited on a detached task; failures are logged there.

use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, error, info};

use super::{PublishError, Result, TimelineEvent, TimelinePublisher};
use crate::feed::KafkaConfig;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaTimelinePublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaTimelinePublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| PublishError::Send(format!("Failed to create Kafka producer: {}", e)))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.timeline_topic,
            "Kafka timeline publisher initialized"
        );

        Ok(Self {
            producer,
            topic: config.timeline_topic.clone(),
        })
    }
}

impl TimelinePublisher for KafkaTimelinePublisher {
    fn publish(&self, event: TimelineEvent) -> Result<()> {
        let payload = event.to_json()?;
        let producer = self.producer.clone();
        let topic = self.topic.clone();

        tokio::spawn(async move {
            let record = FutureRecord::to(&topic)
                .key(&event.chat_id)
                .payload(&payload);
            match producer.send(record, DELIVERY_TIMEOUT).await {
                Ok(_) => debug!(
                    topic = %topic,
                    message_id = %event.message_id,
                    "Published timeline event"
                ),
                Err((e, _)) => error!(
                    topic = %topic,
                    message_id = %event.message_id,
                    error = %e,
                    "Failed to publish timeline event"
                ),
            }
        });

        Ok(())
    }
}
