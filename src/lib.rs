//! mapsync - real-time map mark reconciliation
//!
//! Consumes mark events from a pull-based, at-least-once feed, keeps the
//! authoritative set of active marks for each map, and announces every
//! change as a timeline event.
//!
//! ```text
//! [feed topic] -> StreamConsumer (worker thread) -> MessageStream
//!      -> MapManager -> MapCache (read-through, LRU)
//!                    -> TimelinePublisher
//!                    -> WriteBehind lanes -> persistence service
//! ```

pub mod cache;
pub mod config;
pub mod consumer;
pub mod feed;
pub mod model;
pub mod reconcile;
pub mod storage;
pub mod timeline;
pub mod utils;

#[cfg(test)]
mod test_utils;
