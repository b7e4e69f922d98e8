//! In-memory feed for standalone runs and tests.
//!
//! Each topic is a std channel: producers push records, a single
//! subscription pulls them with a blocking timeout. The feed also counts
//! pulled records per topic so callers can observe backpressure, and keeps
//! the acknowledged offsets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use super::{
    Acknowledger, FeedError, FeedMessage, FeedPosition, FeedSource, Result, Subscription,
};

enum Record {
    Message(FeedMessage),
    Fail(String),
}

struct Topic {
    /// Dropped by `MemoryFeed::close`; the subscription ends once every
    /// producer is gone too.
    sender: Option<Sender<Record>>,
    receiver: Option<Receiver<Record>>,
    next_offset: Arc<AtomicI64>,
    pulled: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    acknowledged: Arc<MemoryAcknowledger>,
}

impl Topic {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender: Some(sender),
            receiver: Some(receiver),
            next_offset: Arc::new(AtomicI64::new(0)),
            pulled: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            acknowledged: Arc::new(MemoryAcknowledger::default()),
        }
    }
}

/// In-memory multi-topic feed.
#[derive(Default)]
pub struct MemoryFeed {
    topics: Mutex<HashMap<String, Topic>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a producer for `topic`, creating the topic if needed.
    ///
    /// Returns `None` once the topic has been closed.
    pub fn producer(&self, topic: &str) -> Option<MemoryProducer> {
        let mut topics = self.topics();
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        let sender = entry.sender.clone()?;
        Some(MemoryProducer {
            topic: topic.to_string(),
            sender,
            next_offset: Arc::clone(&entry.next_offset),
        })
    }

    /// Stop accepting new producers on `topic`.
    ///
    /// The subscription reports `FeedError::Closed` after draining, once all
    /// outstanding producers are dropped.
    pub fn close(&self, topic: &str) {
        if let Some(entry) = self.topics().get_mut(topic) {
            entry.sender = None;
        }
    }

    /// Number of records the subscription on `topic` has pulled so far.
    pub fn pulled(&self, topic: &str) -> usize {
        self.topics()
            .get(topic)
            .map(|t| t.pulled.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Offsets acknowledged on `topic`, in acknowledgement order.
    pub fn acknowledged(&self, topic: &str) -> Vec<i64> {
        self.topics()
            .get(topic)
            .map(|t| t.acknowledged.offsets())
            .unwrap_or_default()
    }

    /// Whether the subscription on `topic` has been closed by its owner.
    pub fn is_subscription_closed(&self, topic: &str) -> bool {
        self.topics()
            .get(topic)
            .map(|t| t.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl FeedSource for MemoryFeed {
    fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        let mut topics = self.topics();
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        let receiver = entry.receiver.take().ok_or_else(|| {
            FeedError::Subscribe(format!("topic '{}' already has a subscriber", topic))
        })?;

        debug!(topic = %topic, "Memory feed subscribed");

        Ok(Box::new(MemorySubscription {
            receiver,
            pulled: Arc::clone(&entry.pulled),
            closed: Arc::clone(&entry.closed),
            acknowledger: Arc::clone(&entry.acknowledged),
        }))
    }
}

/// Producer handle for one topic of a [`MemoryFeed`].
#[derive(Clone)]
pub struct MemoryProducer {
    topic: String,
    sender: Sender<Record>,
    next_offset: Arc<AtomicI64>,
}

impl MemoryProducer {
    /// Append a raw payload; returns its offset.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<i64> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let message = FeedMessage::new(self.topic.clone(), 0, offset, payload.into());
        self.sender
            .send(Record::Message(message))
            .map_err(|_| FeedError::Closed)?;
        Ok(offset)
    }

    /// Append a JSON payload; returns its offset.
    pub fn send_json(&self, value: &serde_json::Value) -> Result<i64> {
        self.send(value.to_string())
    }

    /// Make the subscription fail with `reason` when it reaches this point.
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.sender
            .send(Record::Fail(reason.into()))
            .map_err(|_| FeedError::Closed)
    }
}

struct MemorySubscription {
    receiver: Receiver<Record>,
    pulled: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    acknowledger: Arc<MemoryAcknowledger>,
}

impl Subscription for MemorySubscription {
    fn poll(&mut self, timeout: Duration) -> Result<Option<FeedMessage>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Record::Message(message)) => {
                self.pulled.fetch_add(1, Ordering::SeqCst);
                Ok(Some(message))
            }
            Ok(Record::Fail(reason)) => Err(FeedError::Receive(reason)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FeedError::Closed),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        self.acknowledger.clone()
    }
}

#[derive(Default)]
struct MemoryAcknowledger {
    offsets: Mutex<Vec<i64>>,
}

impl MemoryAcknowledger {
    fn offsets(&self) -> Vec<i64> {
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Acknowledger for MemoryAcknowledger {
    fn acknowledge(&self, position: &FeedPosition) -> Result<()> {
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(position.offset);
        Ok(())
    }
}
