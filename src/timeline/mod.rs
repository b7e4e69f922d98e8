//! Derived timeline events and their publishers.
//!
//! Every state change the reconciliation engine makes to a map is announced
//! as a `TimelineEvent`. Publishing is fire-and-forget: `publish` only fails
//! when the event cannot even be handed to the transport; delivery failures
//! are logged by the publisher and never reach the caller.
//!
//! Implementations:
//! - `ChannelPublisher`: in-process tokio broadcast channel
//! - `KafkaTimelinePublisher`: rdkafka `FutureProducer` (feature `kafka`)
//! - `MockPublisher`: records events for tests

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{MapAggregate, Mark, UserId};

pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock;

pub use channel::ChannelPublisher;
#[cfg(feature = "kafka")]
pub use kafka::KafkaTimelinePublisher;
pub use mock::MockPublisher;

/// `message_type` carried by every timeline event.
pub const TIMELINE_MESSAGE_TYPE: &str = "timeline";

/// Result type for publish operations.
pub type Result<T> = std::result::Result<T, PublishError>;

/// Errors handing an event to a transport.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish failed: {0}")]
    Send(String),
}

/// What happened on the timeline. Integer-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TimelineKind {
    DeleteMark = 1,
    UpdateMark = 2,
    AddMark = 3,
    UpdateMap = 4,
}

impl TimelineKind {
    /// Suffix of the derived message id for mark events.
    fn suffix(self) -> &'static str {
        match self {
            TimelineKind::DeleteMark => "delete",
            TimelineKind::UpdateMark => "update",
            TimelineKind::AddMark => "add",
            TimelineKind::UpdateMap => "map",
        }
    }
}

impl From<TimelineKind> for u8 {
    fn from(kind: TimelineKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for TimelineKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(TimelineKind::DeleteMark),
            2 => Ok(TimelineKind::UpdateMark),
            3 => Ok(TimelineKind::AddMark),
            4 => Ok(TimelineKind::UpdateMap),
            other => Err(format!("{} is not a valid timeline kind", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineMessage {
    pub timeline: TimelineKind,
    pub data: Value,
}

/// Event announcing a change to a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Actor behind the change; `None` for system-originated changes.
    pub user_id: Option<UserId>,
    pub message_type: String,
    /// Map the change applies to.
    pub chat_id: String,
    /// Milliseconds since the epoch when the event was derived.
    pub timestamp: i64,
    pub message: TimelineMessage,
    pub message_id: String,
}

impl TimelineEvent {
    /// Event for a mark transition. The payload is the mark's message id and
    /// the event id is derived from it (`<message_id>-add` and so on).
    pub fn for_mark(kind: TimelineKind, mark: &Mark) -> Self {
        Self {
            user_id: Some(mark.user_id.clone()),
            message_type: TIMELINE_MESSAGE_TYPE.to_string(),
            chat_id: mark.map_id.clone(),
            timestamp: now_millis(),
            message: TimelineMessage {
                timeline: kind,
                data: Value::String(mark.message_id.clone()),
            },
            message_id: format!("{}-{}", mark.message_id, kind.suffix()),
        }
    }

    /// Event for a change to the map's own settings.
    pub fn map_updated(map: &MapAggregate) -> Self {
        Self {
            user_id: None,
            message_type: TIMELINE_MESSAGE_TYPE.to_string(),
            chat_id: map.map_id.clone(),
            timestamp: now_millis(),
            message: TimelineMessage {
                timeline: TimelineKind::UpdateMap,
                data: json!({
                    "scale": map.scale,
                    "initial_location": map.initial_location,
                }),
            },
            message_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn kind(&self) -> TimelineKind {
        self.message.timeline
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sink for timeline events.
pub trait TimelinePublisher: Send + Sync {
    /// Hand `event` to the transport without waiting for delivery.
    fn publish(&self, event: TimelineEvent) -> Result<()>;
}
