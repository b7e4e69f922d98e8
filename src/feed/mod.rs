//! Event feed seam.
//!
//! This module contains:
//! - `Subscription` trait: a blocking, pull-based subscription to one topic
//! - `FeedSource` trait: opens subscriptions
//! - `Acknowledger` trait: marks handled records so they are not redelivered
//! - `FeedMessage`: one record pulled from the feed
//! - Kafka connection configuration
//! - Implementations: in-memory (`MemoryFeed`), Kafka (`kafka` feature)

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaFeed;
pub use memory::{MemoryFeed, MemoryProducer};

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Errors raised by the underlying subscription.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    /// The subscription has no more records and never will.
    #[error("Feed closed")]
    Closed,
}

/// One record pulled from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl FeedMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload,
        }
    }

    /// Decode the payload as JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }

    pub fn position(&self) -> FeedPosition {
        FeedPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Where a record sits in the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Marks records as handled.
///
/// Records pulled from a subscription but never acknowledged are redelivered
/// to the next subscriber of the same group.
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, position: &FeedPosition) -> Result<()>;
}

/// Blocking, pull-based subscription to a single topic.
///
/// Delivery is at-least-once; callers must tolerate duplicates.
pub trait Subscription: Send {
    /// Wait up to `timeout` for the next record.
    ///
    /// Returns `Ok(None)` when nothing arrived in time and
    /// `Err(FeedError::Closed)` once the feed is exhausted.
    fn poll(&mut self, timeout: Duration) -> Result<Option<FeedMessage>>;

    /// Release the underlying resource. Called once, from the worker thread.
    fn close(&mut self);

    /// Handle for acknowledging records from another thread.
    ///
    /// Stays usable after `close`; acknowledgements the feed can no longer
    /// record return an error and the record is redelivered.
    fn acknowledger(&self) -> Arc<dyn Acknowledger>;
}

/// Opens subscriptions on a feed.
pub trait FeedSource: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>>;
}

/// Kafka connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Consumer group ID.
    pub group_id: String,
    /// Where a new consumer group starts (earliest, latest).
    pub auto_offset_reset: String,
    /// Topic receiving derived timeline events.
    pub timeline_topic: String,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path.
    pub ssl_ca_location: Option<String>,
    /// SSL client certificate path.
    pub ssl_certificate_location: Option<String>,
    /// SSL client key path.
    pub ssl_key_location: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "map-service".to_string(),
            auto_offset_reset: "earliest".to_string(),
            timeline_topic: "messenger".to_string(),
            security_protocol: None,
            ssl_ca_location: None,
            ssl_certificate_location: None,
            ssl_key_location: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }
}
