use std::time::Duration;

use serde_json::json;

use super::*;
use crate::cache::CacheConfig;
use crate::storage::{Database, MockDatabase, PersistenceConfig};
use crate::test_utils::{feed_message, make_mark, mark_payload};
use crate::timeline::MockPublisher;

struct Harness {
    db: Arc<MockDatabase>,
    publisher: Arc<MockPublisher>,
    manager: MapManager,
}

fn harness_with(cache: CacheConfig) -> Harness {
    let db = Arc::new(MockDatabase::new());
    let publisher = Arc::new(MockPublisher::new());
    let database: Arc<dyn Database> = db.clone();
    let manager = MapManager::new(
        MapCache::new(Arc::clone(&database), &cache),
        WriteBehind::new(database, &PersistenceConfig::default()),
        publisher.clone(),
        MapsConfig::default(),
    );
    Harness {
        db,
        publisher,
        manager,
    }
}

fn harness() -> Harness {
    harness_with(CacheConfig::default())
}

async fn reconcile(
    manager: &mut MapManager,
    map_id: &str,
    message_id: &str,
    active: bool,
) -> Transition {
    let payload = mark_payload(map_id, message_id, active);
    manager
        .handle_mark(Mark::from_value(&payload).unwrap(), payload)
        .await
        .unwrap()
}

#[test]
fn test_transition_table() {
    let mut map = MapAggregate::new("M1", 15.0, Location::default());

    assert_eq!(apply_mark(&mut map, &make_mark("M1", "A", false)), Transition::Ignored);
    assert!(map.is_empty());

    assert_eq!(apply_mark(&mut map, &make_mark("M1", "A", true)), Transition::Added);
    assert_eq!(map.len(), 1);

    let mut replacement = make_mark("M1", "A", true);
    replacement.title = "replaced".to_string();
    assert_eq!(apply_mark(&mut map, &replacement), Transition::Updated);
    assert_eq!(map.mark("A").unwrap().title, "replaced");

    assert_eq!(apply_mark(&mut map, &make_mark("M1", "A", false)), Transition::Deleted);
    assert!(map.is_empty());
}

#[test]
fn test_transition_timeline_kinds() {
    assert_eq!(Transition::Added.timeline_kind(), Some(TimelineKind::AddMark));
    assert_eq!(Transition::Updated.timeline_kind(), Some(TimelineKind::UpdateMark));
    assert_eq!(Transition::Deleted.timeline_kind(), Some(TimelineKind::DeleteMark));
    assert_eq!(Transition::Ignored.timeline_kind(), None);
}

#[tokio::test]
async fn test_distinct_adds_grow_active_set_and_duplicates_do_not() {
    let mut h = harness();

    for id in ["A", "B", "C", "B", "A"] {
        reconcile(&mut h.manager, "M1", id, true).await;
    }

    let map = h.manager.get_map("M1").await.unwrap();
    assert_eq!(map.active_ids(), vec!["A", "B", "C"]);
    assert_eq!(
        h.publisher.kinds(),
        vec![
            TimelineKind::AddMark,
            TimelineKind::AddMark,
            TimelineKind::AddMark,
            TimelineKind::UpdateMark,
            TimelineKind::UpdateMark,
        ]
    );
}

#[tokio::test]
async fn test_add_update_delete_lifecycle() {
    let mut h = harness();

    let added = make_mark("M1", "A", true);
    h.manager
        .handle_mark(added.clone(), serde_json::to_value(&added).unwrap())
        .await
        .unwrap();
    assert_eq!(h.manager.get_map("M1").await.unwrap().active_ids(), vec!["A"]);

    let mut updated = make_mark("M1", "A", true);
    updated.description = "fire spreading".to_string();
    h.manager
        .handle_mark(updated.clone(), serde_json::to_value(&updated).unwrap())
        .await
        .unwrap();
    let map = h.manager.get_map("M1").await.unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map.mark("A").unwrap().description, "fire spreading");

    let transition = reconcile(&mut h.manager, "M1", "A", false).await;
    assert_eq!(transition, Transition::Deleted);
    assert!(h.manager.get_map("M1").await.unwrap().is_empty());

    let events = h.publisher.published();
    let ids: Vec<&str> = events.iter().map(|e| e.message_id.as_str()).collect();
    assert_eq!(ids, vec!["A-add", "A-update", "A-delete"]);
    assert!(events.iter().all(|e| e.chat_id == "M1"));
    assert!(events.iter().all(|e| e.message.data == json!("A")));

    let stats = h.manager.stats();
    assert_eq!((stats.added, stats.updated, stats.deleted), (1, 1, 1));
}

#[tokio::test]
async fn test_delete_without_add_is_ignored_but_journaled() {
    let mut h = harness();

    let transition = reconcile(&mut h.manager, "M1", "X", false).await;
    h.manager.shutdown().await;

    assert_eq!(transition, Transition::Ignored);
    assert!(h.publisher.published().is_empty());
    assert_eq!(h.db.journal("maps_M1").await.len(), 1);
    assert_eq!(h.manager.stats().ignored, 1);
}

#[tokio::test]
async fn test_first_reference_creates_map_with_defaults() {
    let mut h = harness();

    let lookup = h.manager.get_or_create("M1").await.unwrap();
    assert!(lookup.is_created());
    let map = lookup.into_map();
    assert_eq!(map.scale, DEFAULT_SCALE);
    assert_eq!(map.initial_location, Location::default());

    assert!(!h.manager.get_or_create("M1").await.unwrap().is_created());
    assert!(h.db.document("maps,M1").await.is_some());
}

#[tokio::test]
async fn test_persists_document_and_raw_event() {
    let mut h = harness();

    reconcile(&mut h.manager, "M1", "A", true).await;
    h.manager.shutdown().await;

    let document = h.db.document("maps,M1").await.unwrap();
    let stored = MapAggregate::from_document(document).unwrap();
    assert_eq!(stored.active_ids(), vec!["A"]);
    assert_eq!(h.db.journal("maps_M1").await, vec![mark_payload("M1", "A", true)]);
}

#[tokio::test]
async fn test_hydrates_existing_map_from_store() {
    let mut h = harness();
    let mut stored = MapAggregate::new("M1", 9.0, Location::new(1.0, 1.0));
    stored.upsert(make_mark("M1", "A", true));
    h.db.insert_document("maps,M1", stored.to_document().unwrap())
        .await;

    let transition = reconcile(&mut h.manager, "M1", "A", false).await;

    assert_eq!(transition, Transition::Deleted);
    let map = h.manager.get_map("M1").await.unwrap();
    assert_eq!(map.scale, 9.0);
    assert!(map.is_empty());
}

#[tokio::test]
async fn test_evicted_map_rehydrates_with_completed_writes() {
    let mut h = harness_with(CacheConfig {
        capacity: 1,
        ttl_secs: None,
    });
    reconcile(&mut h.manager, "M1", "A", true).await;
    h.db.push_write_delay(Duration::from_millis(20)).await;
    reconcile(&mut h.manager, "M1", "B", true).await;
    // Evicts M1 while its writes may still be queued.
    reconcile(&mut h.manager, "M2", "C", true).await;

    let transition = reconcile(&mut h.manager, "M1", "A", false).await;
    assert_eq!(transition, Transition::Deleted);
    assert_eq!(h.manager.get_map("M1").await.unwrap().active_ids(), vec!["B"]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_map_rehydrates_with_completed_writes() {
    let mut h = harness_with(CacheConfig {
        capacity: 16,
        ttl_secs: Some(60),
    });
    reconcile(&mut h.manager, "M1", "A", true).await;
    h.db.push_write_delay(Duration::from_secs(120)).await;
    reconcile(&mut h.manager, "M1", "B", true).await;

    // The map expires while its last document write is still in flight.
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(h.db.document("maps,M1").await.is_some());

    let transition = reconcile(&mut h.manager, "M1", "A", false).await;
    assert_eq!(transition, Transition::Deleted);
    assert_eq!(h.manager.get_map("M1").await.unwrap().active_ids(), vec!["B"]);
}

#[tokio::test]
async fn test_malformed_message_fails_alone() {
    let mut h = harness();
    let messages = vec![
        feed_message("maps", 0, &mark_payload("M1", "A", true)),
        FeedMessage::new("maps", 0, 1, b"not json".to_vec()),
        feed_message("maps", 2, &json!({"map_id": "M1", "message_id": "B"})),
        feed_message("maps", 3, &json!({"size": 7})),
        feed_message("maps", 4, &mark_payload("M1", "C", true)),
    ];

    let stats = h.manager.run(futures::stream::iter(messages)).await;

    assert_eq!(stats.processed, 5);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.added, 2);
    assert_eq!(h.manager.get_map("M1").await.unwrap().active_ids(), vec!["A", "C"]);
}

#[tokio::test]
async fn test_create_failure_leaves_map_uncached() {
    let mut h = harness();
    h.db.set_fail_on_post(true).await;

    let payload = mark_payload("M1", "A", true);
    let result = h
        .manager
        .handle_mark(Mark::from_value(&payload).unwrap(), payload)
        .await;
    assert!(matches!(result, Err(ReconcileError::Storage(_))));
    assert!(h.publisher.published().is_empty());

    h.db.set_fail_on_post(false).await;
    assert_eq!(reconcile(&mut h.manager, "M1", "A", true).await, Transition::Added);
}

#[tokio::test]
async fn test_publish_failure_does_not_fail_event() {
    let mut h = harness();
    h.publisher.set_fail_on_publish(true);

    assert_eq!(reconcile(&mut h.manager, "M1", "A", true).await, Transition::Added);
    assert_eq!(h.manager.get_map("M1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_map_rejects_existing() {
    let mut h = harness();

    let map = h
        .manager
        .create_map("M1", 11.0, Location::new(5.0, 6.0))
        .await
        .unwrap();
    assert_eq!(map.scale, 11.0);

    let again = h.manager.create_map("M1", 11.0, Location::default()).await;
    assert!(matches!(
        again,
        Err(ReconcileError::Storage(StorageError::Rejected { .. }))
    ));
}

#[tokio::test]
async fn test_update_map_announces_and_persists() {
    let mut h = harness();
    reconcile(&mut h.manager, "M1", "A", true).await;

    let map = h
        .manager
        .update_map("M1", Some(18.0), Some(Location::new(35.2, 31.7)))
        .await
        .unwrap();
    assert_eq!(map.scale, 18.0);
    assert_eq!(map.active_ids(), vec!["A"]);

    let event = h.publisher.published().pop().unwrap();
    assert_eq!(event.kind(), TimelineKind::UpdateMap);
    assert!(event.user_id.is_none());
    assert_eq!(event.message.data["scale"], json!(18.0));

    let stored = MapAggregate::from_document(h.db.document("maps,M1").await.unwrap()).unwrap();
    assert_eq!(stored.scale, 18.0);
    assert_eq!(stored.initial_location, Location::new(35.2, 31.7));
}

#[tokio::test]
async fn test_update_map_keeps_unspecified_fields() {
    let mut h = harness();
    h.manager
        .create_map("M1", 11.0, Location::new(5.0, 6.0))
        .await
        .unwrap();

    let map = h.manager.update_map("M1", None, None).await.unwrap();
    assert_eq!(map.scale, 11.0);
    assert_eq!(map.initial_location, Location::new(5.0, 6.0));
}

#[tokio::test]
async fn test_update_map_reports_store_failure() {
    let mut h = harness();
    h.manager
        .create_map("M1", 11.0, Location::default())
        .await
        .unwrap();
    h.db.set_fail_on_update(true).await;

    let result = h.manager.update_map("M1", Some(18.0), None).await;
    assert!(matches!(
        result,
        Err(ReconcileError::Storage(StorageError::Connection(_)))
    ));
    let stored = MapAggregate::from_document(h.db.document("maps,M1").await.unwrap()).unwrap();
    assert_eq!(stored.scale, 11.0);
}
