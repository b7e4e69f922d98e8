//! Stream consumer: bridges a blocking feed subscription into an async stream.
//!
//! ```text
//! [Subscription] --poll--> [worker thread] --bounded queue--> [MessageStream]
//!                                ^                                  |
//!                                +------ stop flag / stop signal ---+
//! ```
//!
//! One dedicated OS thread pulls from the subscription and pushes each record
//! onto a bounded `tokio::sync::mpsc` queue. A full queue parks the worker,
//! which stops pulling, so backpressure reaches the subscription without
//! blocking the async scheduler.
//!
//! The worker ends on a stop request, on subscription failure, or when the
//! feed is exhausted. It then closes the subscription and enqueues
//! `BridgeItem::End` carrying the reason. Subscription errors are never
//! re-raised to the stream; they surface only as termination (and in logs).
//!
//! A record is acknowledged to the feed when the stream is polled again after
//! yielding it, so only records the caller finished with are acknowledged.
//! Records still queued when the stream stops are never acknowledged and
//! the feed redelivers them.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::Stream;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::feed::{
    Acknowledger, FeedError, FeedMessage, FeedPosition, FeedSource, Result, Subscription,
};

/// Default bridge queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Default upper bound on a single blocking pull.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;

/// Feed consumption configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Topic carrying mark events.
    pub topic: String,
    /// Bridge queue capacity.
    pub queue_capacity: usize,
    /// Upper bound on one blocking pull, so the worker sees stop requests on
    /// an idle feed.
    pub poll_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            topic: "maps".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

impl FeedConfig {
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Why a message stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// `StreamConsumer::stop` was called.
    Stopped,
    /// The subscription reported it has no more records.
    Exhausted,
    /// The subscription failed; the stream is not restarted.
    Failed(String),
}

/// Entry on the bridge queue.
#[derive(Debug)]
pub enum BridgeItem {
    Message(FeedMessage),
    /// End-of-stream sentinel.
    End(EndReason),
}

/// Owns one subscription and the worker thread pumping it.
pub struct StreamConsumer {
    topic: String,
    acknowledger: Arc<dyn Acknowledger>,
    stopped: Arc<AtomicBool>,
    stop_signal: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
    receiver: Option<mpsc::Receiver<BridgeItem>>,
}

impl StreamConsumer {
    /// Subscribe to `config.topic` and start the worker thread.
    pub fn subscribe(source: &dyn FeedSource, config: &FeedConfig) -> Result<Self> {
        let subscription = source.subscribe(&config.topic)?;
        let acknowledger = subscription.acknowledger();
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let stopped = Arc::new(AtomicBool::new(false));
        let (stop_signal, stop_watch) = watch::channel(false);

        let worker = Worker {
            topic: config.topic.clone(),
            subscription,
            sender,
            stopped: Arc::clone(&stopped),
            stop_watch,
            poll_timeout: config.poll_timeout(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("feed-{}", config.topic))
            .spawn(move || worker.run())
            .map_err(|e| FeedError::Subscribe(format!("Failed to spawn feed worker: {}", e)))?;

        info!(
            topic = %config.topic,
            queue_capacity = config.queue_capacity,
            "Stream consumer started"
        );

        Ok(Self {
            topic: config.topic.clone(),
            acknowledger,
            stopped,
            stop_signal,
            worker: Some(handle),
            receiver: Some(receiver),
        })
    }

    /// Take the message stream.
    ///
    /// The stream is not restartable: only the first call returns it.
    pub fn consume(&mut self) -> Option<MessageStream> {
        let receiver = self.receiver.take()?;
        Some(MessageStream {
            inner: ReceiverStream::new(receiver),
            acknowledger: Arc::clone(&self.acknowledger),
            pending: None,
            stopped: Arc::clone(&self.stopped),
            end: None,
        })
    }

    /// Whether the worker thread is still alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.is_finished())
            .unwrap_or(false)
    }

    /// Request shutdown and wait for the worker thread to exit.
    ///
    /// Once this returns, the worker has closed the subscription and the
    /// stream yields nothing further. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.request_stop();

        let Some(worker) = self.worker.take() else {
            return;
        };

        match tokio::task::spawn_blocking(move || worker.join()).await {
            Ok(Ok(())) => info!(topic = %self.topic, "Stream consumer stopped"),
            Ok(Err(_)) => error!(topic = %self.topic, "Feed worker panicked"),
            Err(e) => error!(topic = %self.topic, error = %e, "Failed to join feed worker"),
        }
    }

    fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Wakes a worker parked on a full queue.
        self.stop_signal.send_replace(true);
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.request_stop();
        }
    }
}

struct Worker {
    topic: String,
    subscription: Box<dyn Subscription>,
    sender: mpsc::Sender<BridgeItem>,
    stopped: Arc<AtomicBool>,
    stop_watch: watch::Receiver<bool>,
    poll_timeout: Duration,
}

impl Worker {
    fn run(mut self) {
        debug!(topic = %self.topic, "Feed worker running");

        let reason = loop {
            if self.stopped.load(Ordering::SeqCst) {
                break EndReason::Stopped;
            }

            let message = match self.subscription.poll(self.poll_timeout) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(FeedError::Closed) => break EndReason::Exhausted,
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "Feed subscription failed");
                    break EndReason::Failed(e.to_string());
                }
            };

            if !self.deliver(BridgeItem::Message(message)) {
                break EndReason::Stopped;
            }
        };

        self.subscription.close();

        // A stopped stream terminates on the flag; only enqueue the sentinel if
        // there is room. Otherwise wait for room so the reason is not lost.
        let end = BridgeItem::End(reason.clone());
        match reason {
            EndReason::Stopped => {
                let _ = self.sender.try_send(end);
            }
            _ => {
                self.deliver(end);
            }
        }

        info!(topic = %self.topic, reason = ?reason, "Feed worker exited");
    }

    /// Push one item, parking while the queue is full.
    ///
    /// Returns false if a stop was requested or the stream was dropped.
    fn deliver(&mut self, item: BridgeItem) -> bool {
        let sender = &self.sender;
        let stop_watch = &mut self.stop_watch;

        futures::executor::block_on(async move {
            tokio::select! {
                biased;
                _ = stop_watch.wait_for(|stop| *stop) => false,
                permit = sender.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(item);
                        true
                    }
                    Err(_) => {
                        warn!("Message stream dropped, feed worker exiting");
                        false
                    }
                },
            }
        })
    }
}

/// Async sequence of feed messages.
///
/// Ends on the `BridgeItem::End` sentinel, when the worker goes away, or as
/// soon as a stop has been requested.
pub struct MessageStream {
    inner: ReceiverStream<BridgeItem>,
    acknowledger: Arc<dyn Acknowledger>,
    /// Last yielded record, acknowledged on the next poll.
    pending: Option<FeedPosition>,
    stopped: Arc<AtomicBool>,
    end: Option<EndReason>,
}

impl MessageStream {
    /// Why the stream ended, once it has.
    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end.as_ref()
    }

    fn acknowledge_pending(&mut self) {
        let Some(position) = self.pending.take() else {
            return;
        };
        if let Err(e) = self.acknowledger.acknowledge(&position) {
            warn!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                error = %e,
                "Record not acknowledged, feed may redeliver it"
            );
        }
    }

    fn finish(&mut self, reason: EndReason) -> Poll<Option<FeedMessage>> {
        debug!(reason = ?reason, "Message stream finished");
        self.end = Some(reason);
        Poll::Ready(None)
    }
}

impl Stream for MessageStream {
    type Item = FeedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.end.is_some() {
            return Poll::Ready(None);
        }
        self.acknowledge_pending();
        if self.stopped.load(Ordering::SeqCst) {
            return self.finish(EndReason::Stopped);
        }

        match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            Some(BridgeItem::Message(_)) if self.stopped.load(Ordering::SeqCst) => {
                self.finish(EndReason::Stopped)
            }
            Some(BridgeItem::Message(message)) => {
                self.pending = Some(message.position());
                Poll::Ready(Some(message))
            }
            Some(BridgeItem::End(reason)) => self.finish(reason),
            None => self.finish(EndReason::Failed(
                "feed worker exited without end marker".to_string(),
            )),
        }
    }
}
