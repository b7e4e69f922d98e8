//! Map and mark entities.
//!
//! `Mark` mirrors the inbound feed payload field for field. `MapAggregate` is
//! the authoritative per-map state and doubles as the document stored by the
//! persistence service:
//!
//! ```text
//! {"_id": "<map_id>", "active_marks": [<mark>...], "scale": 15.0,
//!  "initial_location": {"longitude": 0.0, "latitude": 0.0}}
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Scale applied to maps created without an explicit one.
pub const DEFAULT_SCALE: f64 = 15.0;

/// Raised when an integer enum on the wire carries an unknown value.
#[derive(Debug, thiserror::Error)]
#[error("{value} is not a valid {kind}")]
pub struct InvalidEnumValue {
    kind: &'static str,
    value: i64,
}

/// Geographic point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
}

impl Location {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }
}

/// Kind of marker placed on a map.
///
/// Encoded as an integer on the wire; `null` decodes to [`MarkType::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<i64>", into = "u8")]
pub enum MarkType {
    #[default]
    None = 0,
    Barrier = 1,
    Fire = 2,
    Danger = 3,
    Question = 4,
    CarCrash = 5,
    Rocket = 6,
    TelegramUser = 7,
    Sos = 8,
}

impl TryFrom<Option<i64>> for MarkType {
    type Error = InvalidEnumValue;

    fn try_from(value: Option<i64>) -> Result<Self, Self::Error> {
        let Some(value) = value else {
            return Ok(MarkType::None);
        };
        Ok(match value {
            0 => MarkType::None,
            1 => MarkType::Barrier,
            2 => MarkType::Fire,
            3 => MarkType::Danger,
            4 => MarkType::Question,
            5 => MarkType::CarCrash,
            6 => MarkType::Rocket,
            7 => MarkType::TelegramUser,
            8 => MarkType::Sos,
            other => {
                return Err(InvalidEnumValue {
                    kind: "MarkType",
                    value: other,
                })
            }
        })
    }
}

impl From<MarkType> for u8 {
    fn from(value: MarkType) -> Self {
        value as u8
    }
}

/// Display size of a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub enum MarkSize {
    Small = 1,
    Medium = 2,
    Large = 3,
}

impl TryFrom<i64> for MarkSize {
    type Error = InvalidEnumValue;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MarkSize::Small),
            2 => Ok(MarkSize::Medium),
            3 => Ok(MarkSize::Large),
            other => Err(InvalidEnumValue {
                kind: "MarkSize",
                value: other,
            }),
        }
    }
}

impl From<MarkSize> for u8 {
    fn from(value: MarkSize) -> Self {
        value as u8
    }
}

/// One marker event, identified by `message_id`.
///
/// `active` is a liveness signal rather than a lifecycle stage: an inactive
/// mark for a known id removes it, an active mark adds or replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub user_id: UserId,
    #[serde(default)]
    pub mark_type: MarkType,
    pub map_id: String,
    #[serde(default = "generate_message_id")]
    pub message_id: String,
    /// Milliseconds since the epoch, as sent by the producer. Integer and
    /// fractional values are written back unchanged.
    pub timestamp: serde_json::Number,
    pub active: bool,
    pub location: Location,
    pub description: String,
    pub size: MarkSize,
    pub title: String,
    #[serde(default)]
    pub publish_to_telegram: bool,
}

impl Mark {
    /// Decode a mark from a raw feed payload.
    pub fn from_value(value: &serde_json::Value) -> serde_json::Result<Self> {
        Mark::deserialize(value)
    }
}

fn generate_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Author of a mark: a string id or a numeric chat id, kept as sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Text(id) => f.write_str(id),
            UserId::Number(id) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId::Text(id.to_string())
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId::Number(id.into())
    }
}

/// Authoritative state of one map.
///
/// Holds at most one active mark per message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapAggregate {
    #[serde(rename = "_id")]
    pub map_id: String,
    #[serde(rename = "active_marks", with = "marks_as_list", default)]
    marks: HashMap<String, Mark>,
    pub scale: f64,
    pub initial_location: Location,
}

impl MapAggregate {
    /// Create an empty map.
    pub fn new(map_id: impl Into<String>, scale: f64, initial_location: Location) -> Self {
        Self {
            map_id: map_id.into(),
            marks: HashMap::new(),
            scale,
            initial_location,
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.marks.contains_key(message_id)
    }

    pub fn mark(&self, message_id: &str) -> Option<&Mark> {
        self.marks.get(message_id)
    }

    pub fn marks(&self) -> impl Iterator<Item = &Mark> {
        self.marks.values()
    }

    /// Active message ids, sorted.
    pub fn active_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.marks.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Insert a mark, returning the one it replaced.
    pub fn upsert(&mut self, mark: Mark) -> Option<Mark> {
        self.marks.insert(mark.message_id.clone(), mark)
    }

    pub fn remove(&mut self, message_id: &str) -> Option<Mark> {
        self.marks.remove(message_id)
    }

    /// Serialize to the persisted document shape.
    pub fn to_document(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_document(document: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(document)
    }
}

/// Stores the mark set as a list sorted by message id; duplicate ids in a
/// stored document collapse to the last one.
mod marks_as_list {
    use std::collections::HashMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Mark;

    pub fn serialize<S>(marks: &HashMap<String, Mark>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut list: Vec<&Mark> = marks.values().collect();
        list.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Mark>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<Mark>::deserialize(deserializer)?;
        Ok(list
            .into_iter()
            .map(|mark| (mark.message_id.clone(), mark))
            .collect())
    }
}
