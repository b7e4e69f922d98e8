//! mapsync: map mark reconciliation daemon
//!
//! ## Architecture
//! ```text
//! [Kafka: marks] -> [feed worker] -> [MapManager] -> [Kafka: timeline]
//!                                          |
//!                                          v
//!                                 [persistence service]
//! ```
//!
//! ## Configuration
//! - First argument: optional YAML config file
//! - MAPSYNC_CONFIG: YAML config file
//! - MAPSYNC__<SECTION>__<KEY>: per-setting overrides
//! - DATABASE_SERVICE_URL / DATABASE_AUTH_KEY: persistence service
//! - MAPSYNC_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use mapsync::cache::MapCache;
use mapsync::config::Config;
use mapsync::consumer::StreamConsumer;
use mapsync::feed::KafkaFeed;
use mapsync::reconcile::MapManager;
use mapsync::storage::{Database, HttpDatabase, WriteBehind};
use mapsync::timeline::{KafkaTimelinePublisher, TimelinePublisher};
use mapsync::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(topic = %config.feed.topic, "Starting mapsync");

    let database: Arc<dyn Database> = Arc::new(HttpDatabase::new(&config.database)?);
    let publisher: Arc<dyn TimelinePublisher> =
        Arc::new(KafkaTimelinePublisher::new(&config.kafka)?);

    let mut manager = MapManager::new(
        MapCache::new(Arc::clone(&database), &config.cache),
        WriteBehind::new(database, &config.persistence),
        publisher,
        config.maps.clone(),
    );

    let feed = KafkaFeed::new(config.kafka.clone());
    let mut consumer = StreamConsumer::subscribe(&feed, &config.feed)?;
    let stream = consumer
        .consume()
        .ok_or("Message stream was already taken")?;

    info!("mapsync running, press Ctrl+C to exit");

    let stats = {
        let run = manager.run(stream);
        tokio::pin!(run);

        tokio::select! {
            stats = &mut run => stats,
            result = shutdown_signal() => {
                if let Err(e) = result {
                    error!(error = %e, "Signal handler failed, shutting down");
                }
                // Ends the stream; the loop finishes the message in hand.
                consumer.stop().await;
                run.await
            }
        }
    };

    consumer.stop().await;
    manager.shutdown().await;

    info!(
        processed = stats.processed,
        failed = stats.failed,
        added = stats.added,
        updated = stats.updated,
        deleted = stats.deleted,
        ignored = stats.ignored,
        "mapsync stopped"
    );
    Ok(())
}
