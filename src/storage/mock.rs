//! Mock persistence service for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Database, RecordKind, Result, StorageError};

/// One completed write, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub kind: RecordKind,
    pub key: String,
    pub value: Value,
}

/// In-memory persistence service.
///
/// Documents behave like a document collection: `post` refuses an existing
/// key and `update` refuses a missing one. Messenger posts append to a
/// per-key journal.
#[derive(Default)]
pub struct MockDatabase {
    documents: RwLock<HashMap<String, Value>>,
    journals: RwLock<HashMap<String, Vec<Value>>>,
    writes: RwLock<Vec<WriteRecord>>,
    write_delays: RwLock<VecDeque<Duration>>,
    gets: AtomicUsize,
    fail_on_get: RwLock<bool>,
    fail_on_post: RwLock<bool>,
    fail_on_update: RwLock<bool>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_get(&self, fail: bool) {
        *self.fail_on_get.write().await = fail;
    }

    pub async fn set_fail_on_post(&self, fail: bool) {
        *self.fail_on_post.write().await = fail;
    }

    pub async fn set_fail_on_update(&self, fail: bool) {
        *self.fail_on_update.write().await = fail;
    }

    /// Delay the next write to arrive by `delay`. Delays queue up in order.
    pub async fn push_write_delay(&self, delay: Duration) {
        self.write_delays.write().await.push_back(delay);
    }

    /// Seed a document without recording a write.
    pub async fn insert_document(&self, key: impl Into<String>, value: Value) {
        self.documents.write().await.insert(key.into(), value);
    }

    pub async fn document(&self, key: &str) -> Option<Value> {
        self.documents.read().await.get(key).cloned()
    }

    pub async fn journal(&self, key: &str) -> Vec<Value> {
        self.journals
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.writes.read().await.clone()
    }

    /// Number of `get` calls served.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    async fn delay_write(&self) {
        let delay = self.write_delays.write().await.pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn record(&self, kind: RecordKind, key: &str, value: &Value) {
        self.writes.write().await.push(WriteRecord {
            kind,
            key: key.to_string(),
            value: value.clone(),
        });
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn get(&self, kind: RecordKind, key: &str) -> Result<Option<Value>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_get.read().await {
            return Err(StorageError::Connection("Mock get failure".to_string()));
        }
        Ok(match kind {
            RecordKind::CollectionCommaIdValue => self.document(key).await,
            RecordKind::Messenger => {
                let journal = self.journal(key).await;
                (!journal.is_empty()).then(|| Value::Array(journal))
            }
        })
    }

    async fn post(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()> {
        self.delay_write().await;
        if *self.fail_on_post.read().await {
            return Err(StorageError::Connection("Mock post failure".to_string()));
        }
        match kind {
            RecordKind::CollectionCommaIdValue => {
                let mut documents = self.documents.write().await;
                if documents.contains_key(key) {
                    return Err(StorageError::Rejected {
                        key: key.to_string(),
                    });
                }
                documents.insert(key.to_string(), value.clone());
            }
            RecordKind::Messenger => {
                self.journals
                    .write()
                    .await
                    .entry(key.to_string())
                    .or_default()
                    .push(value.clone());
            }
        }
        self.record(kind, key, value).await;
        Ok(())
    }

    async fn update(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()> {
        self.delay_write().await;
        if *self.fail_on_update.read().await {
            return Err(StorageError::Connection("Mock update failure".to_string()));
        }
        if kind != RecordKind::CollectionCommaIdValue {
            return Err(StorageError::Rejected {
                key: key.to_string(),
            });
        }
        {
            let mut documents = self.documents.write().await;
            let Some(document) = documents.get_mut(key) else {
                return Err(StorageError::NotFound {
                    key: key.to_string(),
                });
            };
            *document = value.clone();
        }
        self.record(kind, key, value).await;
        Ok(())
    }

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        let removed = match kind {
            RecordKind::CollectionCommaIdValue => {
                self.documents.write().await.remove(key).is_some()
            }
            RecordKind::Messenger => self.journals.write().await.remove(key).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(StorageError::NotFound {
                key: key.to_string(),
            })
        }
    }
}
