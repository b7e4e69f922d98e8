//! Reconciliation engine.
//!
//! Consumes decoded mark events one at a time, in arrival order:
//!
//! ```text
//! FeedMessage -> Mark -> get_or_create(map) -> apply_mark -> TimelineEvent
//!                                                         -> write lane: map document
//!                                                         -> write lane: raw event journal
//! ```
//!
//! Transitions are keyed on whether the mark's `message_id` is in the map's
//! active set and on the incoming `active` flag. The latest processed event
//! wins; there is no timestamp comparison, so redelivered or reordered events
//! can regress visible state.
//!
//! Persistence is handed to the write-behind lanes and not awaited. The only
//! suspension points on the hot path are pulling the next message and the
//! first reference to a map (hydration or creation).

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::MapCache;
use crate::feed::FeedMessage;
use crate::model::{Location, MapAggregate, Mark, DEFAULT_SCALE};
use crate::storage::{map_journal_key, map_key, RecordKind, StorageError, WriteBehind};
use crate::timeline::{TimelineEvent, TimelineKind, TimelinePublisher};

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Errors affecting a single event or map operation.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Malformed event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Defaults for maps created on first reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapsConfig {
    pub default_scale: f64,
    pub default_location: Location,
}

impl Default for MapsConfig {
    fn default() -> Self {
        Self {
            default_scale: DEFAULT_SCALE,
            default_location: Location::default(),
        }
    }
}

/// Outcome of applying one mark to its map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Unknown id, active: inserted.
    Added,
    /// Known id, active: replaced.
    Updated,
    /// Known id, inactive: removed.
    Deleted,
    /// Unknown id, inactive: nothing to do.
    Ignored,
}

impl Transition {
    /// Timeline event announcing this transition, if any.
    pub fn timeline_kind(self) -> Option<TimelineKind> {
        match self {
            Transition::Added => Some(TimelineKind::AddMark),
            Transition::Updated => Some(TimelineKind::UpdateMark),
            Transition::Deleted => Some(TimelineKind::DeleteMark),
            Transition::Ignored => None,
        }
    }
}

/// Apply `mark` to `map` and report what changed.
pub fn apply_mark(map: &mut MapAggregate, mark: &Mark) -> Transition {
    match (map.contains(&mark.message_id), mark.active) {
        (true, false) => {
            map.remove(&mark.message_id);
            Transition::Deleted
        }
        (true, true) => {
            map.upsert(mark.clone());
            Transition::Updated
        }
        (false, true) => {
            map.upsert(mark.clone());
            Transition::Added
        }
        (false, false) => Transition::Ignored,
    }
}

/// Result of `MapManager::get_or_create`.
#[derive(Debug)]
pub enum MapLookup<'a> {
    /// Neither cache nor store knew the map; it was created with defaults.
    Created(&'a mut MapAggregate),
    /// Found in the cache or hydrated from the store.
    Found(&'a mut MapAggregate),
}

impl<'a> MapLookup<'a> {
    pub fn is_created(&self) -> bool {
        matches!(self, MapLookup::Created(_))
    }

    pub fn into_map(self) -> &'a mut MapAggregate {
        match self {
            MapLookup::Created(map) | MapLookup::Found(map) => map,
        }
    }
}

/// Counters for everything the engine has handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Messages taken off the stream.
    pub processed: u64,
    /// Messages that failed to decode or reconcile.
    pub failed: u64,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub ignored: u64,
}

impl ReconcileStats {
    fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Added => self.added += 1,
            Transition::Updated => self.updated += 1,
            Transition::Deleted => self.deleted += 1,
            Transition::Ignored => self.ignored += 1,
        }
    }
}

/// Owns map state and drives reconciliation.
pub struct MapManager {
    cache: MapCache,
    writer: WriteBehind,
    publisher: Arc<dyn TimelinePublisher>,
    maps: MapsConfig,
    stats: ReconcileStats,
}

impl MapManager {
    pub fn new(
        cache: MapCache,
        writer: WriteBehind,
        publisher: Arc<dyn TimelinePublisher>,
        maps: MapsConfig,
    ) -> Self {
        Self {
            cache,
            writer,
            publisher,
            maps,
            stats: ReconcileStats::default(),
        }
    }

    /// Reconcile every message until the stream ends.
    ///
    /// Per-message failures are logged and counted; they never end the loop.
    pub async fn run<S>(&mut self, stream: S) -> ReconcileStats
    where
        S: Stream<Item = FeedMessage>,
    {
        futures::pin_mut!(stream);
        info!("Reconciliation loop started");

        while let Some(message) = stream.next().await {
            self.stats.processed += 1;
            if let Err(e) = self.handle_message(&message).await {
                self.stats.failed += 1;
                error!(
                    topic = %message.topic,
                    offset = message.offset,
                    error = %e,
                    "Failed to reconcile message"
                );
            }
        }

        info!(stats = ?self.stats, "Reconciliation loop finished");
        self.stats
    }

    /// Decode one feed message and reconcile it.
    #[tracing::instrument(
        name = "reconcile.message",
        skip_all,
        fields(topic = %message.topic, offset = message.offset)
    )]
    pub async fn handle_message(&mut self, message: &FeedMessage) -> Result<Transition> {
        let raw = message.json()?;
        let mark = Mark::from_value(&raw)?;
        self.handle_mark(mark, raw).await
    }

    /// Reconcile a decoded mark. `raw` is journaled as received.
    pub async fn handle_mark(&mut self, mark: Mark, raw: Value) -> Result<Transition> {
        let map_id = mark.map_id.clone();
        let map = self.get_or_create(&map_id).await?.into_map();

        let transition = apply_mark(map, &mark);
        let document = map.to_document()?;
        let active = map.len();

        if let Some(kind) = transition.timeline_kind() {
            self.publish(TimelineEvent::for_mark(kind, &mark));
        }

        self.writer.update(
            &map_id,
            RecordKind::CollectionCommaIdValue,
            map_key(&map_id),
            document,
        );
        self.writer
            .post(&map_id, RecordKind::Messenger, map_journal_key(&map_id), raw);

        self.stats.record(transition);
        debug!(
            map_id = %map_id,
            message_id = %mark.message_id,
            transition = ?transition,
            active,
            "Mark reconciled"
        );
        Ok(transition)
    }

    /// Find a map in the cache or store, creating it with defaults if
    /// neither has it.
    ///
    /// A map that is about to be hydrated has its write lane drained first,
    /// so the store reflects every write issued before it was evicted.
    pub async fn get_or_create(&mut self, map_id: &str) -> Result<MapLookup<'_>> {
        // Expiry is decided once, here; the lookup below does not re-check it.
        let mut created = false;
        if !self.cache.is_cached(map_id) {
            self.writer.flush(map_id).await;
            if self.cache.hydrate(map_id).await?.is_none() {
                let (scale, location) = (self.maps.default_scale, self.maps.default_location);
                self.create(map_id, scale, location).await?;
                created = true;
            }
        }

        let map = self
            .cache
            .resident(map_id)
            .ok_or_else(|| StorageError::NotFound {
                key: map_key(map_id),
            })?;
        Ok(if created {
            MapLookup::Created(map)
        } else {
            MapLookup::Found(map)
        })
    }

    /// Create a map and store it. The map is cached only once the store has
    /// accepted it.
    pub async fn create_map(
        &mut self,
        map_id: &str,
        scale: f64,
        initial_location: Location,
    ) -> Result<MapAggregate> {
        self.create(map_id, scale, initial_location).await?;
        let map = self
            .cache
            .resident(map_id)
            .ok_or_else(|| StorageError::NotFound {
                key: map_key(map_id),
            })?;
        Ok(map.clone())
    }

    /// Change a map's scale and/or origin, announce it, and wait for the
    /// store to apply it.
    pub async fn update_map(
        &mut self,
        map_id: &str,
        scale: Option<f64>,
        initial_location: Option<Location>,
    ) -> Result<MapAggregate> {
        let map = self.get_or_create(map_id).await?.into_map();
        if let Some(scale) = scale {
            map.scale = scale;
        }
        if let Some(location) = initial_location {
            map.initial_location = location;
        }
        let snapshot = map.clone();
        let document = snapshot.to_document()?;

        self.publish(TimelineEvent::map_updated(&snapshot));
        self.writer
            .update_acked(
                map_id,
                RecordKind::CollectionCommaIdValue,
                map_key(map_id),
                document,
            )
            .wait()
            .await?;

        info!(map_id, scale = snapshot.scale, "Map updated");
        Ok(snapshot)
    }

    /// Current state of a map, creating it if it does not exist.
    pub async fn get_map(&mut self, map_id: &str) -> Result<MapAggregate> {
        let map = self.get_or_create(map_id).await?.into_map();
        Ok(map.clone())
    }

    /// Wait for every queued write to reach the store.
    pub async fn shutdown(&mut self) {
        self.writer.flush_all().await;
        info!(stats = ?self.stats, "Map manager shut down");
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    async fn create(&mut self, map_id: &str, scale: f64, location: Location) -> Result<()> {
        let map = MapAggregate::new(map_id, scale, location);
        let document = map.to_document()?;

        self.writer
            .post_acked(
                map_id,
                RecordKind::CollectionCommaIdValue,
                map_key(map_id),
                document,
            )
            .wait()
            .await?;

        info!(map_id, scale, "Map created");
        self.cache.insert(map);
        Ok(())
    }

    fn publish(&self, event: TimelineEvent) {
        let message_id = event.message_id.clone();
        if let Err(e) = self.publisher.publish(event) {
            warn!(message_id = %message_id, error = %e, "Failed to publish timeline event");
        }
    }
}

#[cfg(test)]
mod tests;
