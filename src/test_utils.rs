//! Test utilities shared by unit tests.

use serde_json::{json, Value};

use crate::feed::FeedMessage;
use crate::model::{Location, Mark, MarkSize, MarkType, UserId};

/// Raw feed payload for a mark with fixed descriptive fields.
pub fn mark_payload(map_id: &str, message_id: &str, active: bool) -> Value {
    json!({
        "user_id": "user-1",
        "mark_type": 2,
        "map_id": map_id,
        "message_id": message_id,
        "timestamp": 1_700_000_000_000u64,
        "active": active,
        "location": {"longitude": 34.78, "latitude": 32.08},
        "description": "smoke seen",
        "size": 2,
        "title": "title",
    })
}

pub fn make_mark(map_id: &str, message_id: &str, active: bool) -> Mark {
    Mark {
        user_id: UserId::from("user-1"),
        mark_type: MarkType::Fire,
        map_id: map_id.to_string(),
        message_id: message_id.to_string(),
        timestamp: 1_700_000_000_000i64.into(),
        active,
        location: Location::new(34.78, 32.08),
        description: "smoke seen".to_string(),
        size: MarkSize::Medium,
        title: "title".to_string(),
        publish_to_telegram: false,
    }
}

/// Wrap a JSON payload as a feed message at the given offset.
pub fn feed_message(topic: &str, offset: i64, payload: &Value) -> FeedMessage {
    FeedMessage::new(topic, 0, offset, payload.to_string().into_bytes())
}
