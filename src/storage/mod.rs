//! Persistence collaborator.
//!
//! This module contains:
//! - `Database` trait: get/post/update/delete against the persistence service
//! - `RecordKind`: the service's request types used by this crate
//! - Key helpers for map documents and the raw event journal
//! - Implementations: HTTP (`HttpDatabase`), Mock
//! - `WriteBehind`: ordered, non-blocking write lanes

use async_trait::async_trait;
use serde_json::Value;

pub mod http;
pub mod mock;
pub mod writer;

pub use http::{DatabaseConfig, HttpDatabase};
pub use mock::MockDatabase;
pub use writer::{PersistenceConfig, WriteAck, WriteBehind};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur talking to the persistence service.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request for '{key}' failed: {message}")]
    Request { key: String, message: String },

    #[error("Request for '{key}' was rejected")]
    Rejected { key: String },

    #[error("Record not found: {key}")]
    NotFound { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Write lane closed before acknowledging '{key}'")]
    LaneClosed { key: String },
}

/// Request type understood by the persistence service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Document addressed as `"<collection>,<id>"`.
    CollectionCommaIdValue = 1,
    /// Append-only message table addressed by table id.
    Messenger = 2,
}

impl RecordKind {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Key of a map document: `"maps,<map_id>"`.
pub fn map_key(map_id: &str) -> String {
    format!("maps,{}", map_id)
}

/// Key of a map's raw event journal: `"maps_<map_id>"`.
pub fn map_journal_key(map_id: &str) -> String {
    format!("maps_{}", map_id)
}

/// Interface to the persistence service.
///
/// Implementations:
/// - `HttpDatabase`: the persistence service's REST surface
/// - `MockDatabase`: In-memory mock for testing
#[async_trait]
pub trait Database: Send + Sync {
    /// Fetch a record. Returns `None` if the service has no data for `key`.
    async fn get(&self, kind: RecordKind, key: &str) -> Result<Option<Value>>;

    /// Create a record (or append, for `RecordKind::Messenger`).
    async fn post(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()>;

    /// Replace an existing record.
    async fn update(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()>;

    /// Delete a record.
    async fn delete(&self, kind: RecordKind, key: &str) -> Result<()>;
}
