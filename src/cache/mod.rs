//! Read-through entity cache for map aggregates.
//!
//! Bounded LRU keyed by map id, with an optional time-to-live measured from
//! when an entry was loaded or inserted. A miss falls through to the
//! persistence service; a hit there is decoded and cached. A miss in both
//! places is reported as `None`, leaving creation to the caller.
//!
//! The cache is owned by the reconciliation engine and mutated only from
//! its task, so it takes `&mut self` rather than locking internally.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::model::MapAggregate;
use crate::storage::{self, map_key, Database, RecordKind};

/// Default number of maps kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Entity cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached maps.
    pub capacity: usize,
    /// Evict entries this long after they were loaded. Unset keeps entries
    /// until LRU pressure removes them.
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            ttl_secs: None,
        }
    }
}

struct Entry {
    map: MapAggregate,
    loaded_at: Instant,
}

/// Bounded read-through cache of `MapAggregate`s.
pub struct MapCache {
    database: Arc<dyn Database>,
    entries: LruCache<String, Entry>,
    ttl: Option<Duration>,
}

impl MapCache {
    pub fn new(database: Arc<dyn Database>, config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            database,
            entries: LruCache::new(capacity),
            ttl: config.ttl_secs.map(Duration::from_secs),
        }
    }

    /// Whether a live entry for `map_id` is held in memory.
    ///
    /// Drops the entry if it has outlived the TTL.
    pub fn is_cached(&mut self, map_id: &str) -> bool {
        let expired = match self.entries.peek(map_id) {
            None => return false,
            Some(entry) => self.is_expired(entry),
        };
        if expired {
            debug!(map_id, "Cached map expired");
            self.entries.pop(map_id);
        }
        !expired
    }

    /// Look up a map, loading it from the store on a miss.
    ///
    /// Returns `Ok(None)` when neither the cache nor the store knows it.
    pub async fn get(&mut self, map_id: &str) -> storage::Result<Option<&mut MapAggregate>> {
        if self.is_cached(map_id) {
            return Ok(self.resident(map_id));
        }
        self.hydrate(map_id).await
    }

    /// Load `map_id` from the store and cache it, replacing any entry.
    pub async fn hydrate(&mut self, map_id: &str) -> storage::Result<Option<&mut MapAggregate>> {
        let Some(map) = self.load(map_id).await? else {
            return Ok(None);
        };
        self.put(map_id.to_string(), map);
        Ok(self.resident(map_id))
    }

    /// Entry held in memory, marked most recently used.
    ///
    /// Does not check the TTL: pair it with an `is_cached` decision so a map
    /// cannot expire between the check and the lookup.
    pub fn resident(&mut self, map_id: &str) -> Option<&mut MapAggregate> {
        self.entries.get_mut(map_id).map(|entry| &mut entry.map)
    }

    /// Cache `map` under its own id, replacing any existing entry.
    pub fn insert(&mut self, map: MapAggregate) -> &mut MapAggregate {
        let map_id = map.map_id.clone();
        self.entries.pop(&map_id);
        let entry = self.entries.get_or_insert_mut(map_id, || Entry {
            map,
            loaded_at: Instant::now(),
        });
        &mut entry.map
    }

    /// Cached map without touching recency or loading from the store.
    pub fn peek(&self, map_id: &str) -> Option<&MapAggregate> {
        self.entries
            .peek(map_id)
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| &entry.map)
    }

    pub fn invalidate(&mut self, map_id: &str) -> Option<MapAggregate> {
        self.entries.pop(map_id).map(|entry| entry.map)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    async fn load(&self, map_id: &str) -> storage::Result<Option<MapAggregate>> {
        let Some(document) = self
            .database
            .get(RecordKind::CollectionCommaIdValue, &map_key(map_id))
            .await?
        else {
            debug!(map_id, "Map not found in store");
            return Ok(None);
        };

        let mut map = MapAggregate::from_document(document)?;
        if map.map_id != map_id {
            warn!(map_id, stored_id = %map.map_id, "Stored map carries a different id");
            map.map_id = map_id.to_string();
        }
        debug!(map_id, marks = map.len(), "Map hydrated from store");
        Ok(Some(map))
    }

    fn put(&mut self, map_id: String, map: MapAggregate) {
        let entry = Entry {
            map,
            loaded_at: Instant::now(),
        };
        if let Some((evicted, _)) = self.entries.push(map_id.clone(), entry) {
            if evicted != map_id {
                debug!(map_id = %evicted, "Map evicted from cache");
            }
        }
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.loaded_at.elapsed() >= ttl)
    }
}
