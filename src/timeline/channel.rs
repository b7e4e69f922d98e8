//! In-process timeline publisher.
//!
//! Broadcasts events to every subscriber in the process. Useful for
//! standalone runs and for embedding the engine next to its consumers.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{Result, TimelineEvent, TimelinePublisher};

const CHANNEL_CAPACITY: usize = 1024;

/// Timeline publisher over a tokio broadcast channel.
pub struct ChannelPublisher {
    sender: broadcast::Sender<Arc<TimelineEvent>>,
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPublisher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        info!(capacity = CHANNEL_CAPACITY, "Channel timeline publisher initialized");
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TimelineEvent>> {
        self.sender.subscribe()
    }
}

impl TimelinePublisher for ChannelPublisher {
    fn publish(&self, event: TimelineEvent) -> Result<()> {
        let message_id = event.message_id.clone();
        match self.sender.send(Arc::new(event)) {
            Ok(receivers) => debug!(message_id = %message_id, receivers, "Timeline event broadcast"),
            // Nobody listening is not a failure for a broadcast.
            Err(_) => debug!(message_id = %message_id, "Timeline event dropped, no subscribers"),
        }
        Ok(())
    }
}
