//! Write-behind persistence lanes.
//!
//! Every aggregate gets its own lane: an unbounded FIFO drained by a single
//! writer task. Writes for one aggregate therefore reach the store in the
//! order they were enqueued, while different aggregates persist
//! concurrently. Enqueueing never waits on the store, so a store that falls
//! behind grows the lane without bound; every `lane_warn_depth` queued ops a
//! warning is logged.
//!
//! A lane task exits after sitting idle for `lane_idle_secs`. It closes its
//! queue first and drains whatever slipped in, so nothing is dropped; the
//! next write for that aggregate spawns a fresh lane that waits for the old
//! task to finish before applying anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Database, RecordKind, Result, StorageError};

/// Background persistence configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Retries after a transient failure. Zero means one attempt.
    pub max_retries: usize,
    /// First retry delay; later retries back off exponentially.
    pub retry_min_delay_ms: u64,
    /// Idle time after which a lane's writer task exits.
    pub lane_idle_secs: u64,
    /// Queued ops per lane between backlog warnings. Zero disables them.
    pub lane_warn_depth: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_min_delay_ms: 50,
            lane_idle_secs: 30,
            lane_warn_depth: 1000,
        }
    }
}

impl PersistenceConfig {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry_min_delay_ms))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMethod {
    Post,
    Update,
}

struct PendingWrite {
    method: WriteMethod,
    kind: RecordKind,
    key: String,
    value: Value,
    ack: Option<oneshot::Sender<Result<()>>>,
}

enum LaneOp {
    Write(PendingWrite),
    /// Completes once every earlier op on the lane has been applied.
    Barrier(oneshot::Sender<()>),
}

struct Lane {
    sender: mpsc::UnboundedSender<LaneOp>,
    task: JoinHandle<()>,
    /// Ops sent but not yet taken by the writer task.
    queued: Arc<AtomicUsize>,
}

/// Completion handle for a write whose outcome the caller wants.
pub struct WriteAck {
    key: String,
    receiver: oneshot::Receiver<Result<()>>,
}

impl WriteAck {
    /// Wait until the write has been applied (or has finally failed).
    pub async fn wait(self) -> Result<()> {
        self.receiver
            .await
            .map_err(|_| StorageError::LaneClosed { key: self.key })?
    }
}

/// Per-aggregate ordered write lanes over a `Database`.
pub struct WriteBehind {
    database: Arc<dyn Database>,
    lanes: HashMap<String, Lane>,
    backoff: ExponentialBuilder,
    idle: Duration,
    warn_depth: usize,
}

impl WriteBehind {
    pub fn new(database: Arc<dyn Database>, config: &PersistenceConfig) -> Self {
        Self {
            database,
            lanes: HashMap::new(),
            backoff: config.backoff(),
            idle: Duration::from_secs(config.lane_idle_secs.max(1)),
            warn_depth: config.lane_warn_depth,
        }
    }

    /// Enqueue a create on `lane`. Failures are logged, not returned.
    pub fn post(&mut self, lane: &str, kind: RecordKind, key: impl Into<String>, value: Value) {
        self.write(lane, WriteMethod::Post, kind, key.into(), value, None);
    }

    /// Enqueue a replace on `lane`. Failures are logged, not returned.
    pub fn update(&mut self, lane: &str, kind: RecordKind, key: impl Into<String>, value: Value) {
        self.write(lane, WriteMethod::Update, kind, key.into(), value, None);
    }

    /// Enqueue a create on `lane` and hand back its acknowledgement.
    pub fn post_acked(
        &mut self,
        lane: &str,
        kind: RecordKind,
        key: impl Into<String>,
        value: Value,
    ) -> WriteAck {
        self.acked(lane, WriteMethod::Post, kind, key.into(), value)
    }

    /// Enqueue a replace on `lane` and hand back its acknowledgement.
    pub fn update_acked(
        &mut self,
        lane: &str,
        kind: RecordKind,
        key: impl Into<String>,
        value: Value,
    ) -> WriteAck {
        self.acked(lane, WriteMethod::Update, kind, key.into(), value)
    }

    /// Wait until everything enqueued on `lane` so far has been applied.
    pub async fn flush(&mut self, lane: &str) {
        if let Some(done) = self.barrier(lane) {
            let _ = done.await;
        }
    }

    /// Wait until every lane has drained.
    pub async fn flush_all(&mut self) {
        let names: Vec<String> = self.lanes.keys().cloned().collect();
        let pending: Vec<_> = names
            .iter()
            .filter_map(|name| self.barrier(name))
            .collect();

        debug!(lanes = pending.len(), "Flushing write lanes");
        futures::future::join_all(pending).await;
        self.prune();
    }

    /// Lanes whose writer task is still alive.
    pub fn lane_count(&self) -> usize {
        self.lanes
            .values()
            .filter(|lane| !lane.task.is_finished())
            .count()
    }

    /// Ops waiting on `lane`, not counting one already being applied.
    pub fn queued(&self, lane: &str) -> usize {
        self.lanes
            .get(lane)
            .map(|lane| lane.queued.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn acked(
        &mut self,
        lane: &str,
        method: WriteMethod,
        kind: RecordKind,
        key: String,
        value: Value,
    ) -> WriteAck {
        let (ack, receiver) = oneshot::channel();
        self.write(lane, method, kind, key.clone(), value, Some(ack));
        WriteAck { key, receiver }
    }

    fn write(
        &mut self,
        lane: &str,
        method: WriteMethod,
        kind: RecordKind,
        key: String,
        value: Value,
        ack: Option<oneshot::Sender<Result<()>>>,
    ) {
        self.enqueue(
            lane,
            LaneOp::Write(PendingWrite {
                method,
                kind,
                key,
                value,
                ack,
            }),
        );
    }

    fn barrier(&mut self, lane: &str) -> Option<oneshot::Receiver<()>> {
        if self.lanes.get(lane)?.task.is_finished() {
            self.lanes.remove(lane);
            return None;
        }
        let (done, receiver) = oneshot::channel();
        self.enqueue(lane, LaneOp::Barrier(done));
        Some(receiver)
    }

    fn enqueue(&mut self, lane: &str, op: LaneOp) {
        let op = match self.lanes.get(lane) {
            Some(existing) => {
                let queued = existing.queued.fetch_add(1, Ordering::SeqCst) + 1;
                match existing.sender.send(op) {
                    Ok(()) => {
                        self.warn_on_backlog(lane, queued);
                        return;
                    }
                    // The lane went idle and closed; respawn behind it.
                    Err(mpsc::error::SendError(op)) => {
                        existing.queued.fetch_sub(1, Ordering::SeqCst);
                        op
                    }
                }
            }
            None => op,
        };

        let previous = self.lanes.remove(lane).map(|old| old.task);
        self.prune();

        let (sender, queued) = self.spawn_lane(lane, previous);
        queued.fetch_add(1, Ordering::SeqCst);
        if sender.send(op).is_err() {
            queued.fetch_sub(1, Ordering::SeqCst);
            error!(lane, "Fresh write lane refused an op");
        }
    }

    fn warn_on_backlog(&self, lane: &str, queued: usize) {
        if self.warn_depth > 0 && queued % self.warn_depth == 0 {
            warn!(lane, queued, "Write lane backlog growing, store is falling behind");
        }
    }

    fn spawn_lane(
        &mut self,
        lane: &str,
        previous: Option<JoinHandle<()>>,
    ) -> (mpsc::UnboundedSender<LaneOp>, Arc<AtomicUsize>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker = LaneWorker {
            name: lane.to_string(),
            database: Arc::clone(&self.database),
            backoff: self.backoff,
            idle: self.idle,
            queued: Arc::clone(&queued),
        };
        let task = tokio::spawn(worker.run(receiver, previous));

        debug!(lane, "Write lane started");
        self.lanes.insert(
            lane.to_string(),
            Lane {
                sender: sender.clone(),
                task,
                queued: Arc::clone(&queued),
            },
        );
        (sender, queued)
    }

    fn prune(&mut self) {
        self.lanes.retain(|_, lane| !lane.task.is_finished());
    }
}

struct LaneWorker {
    name: String,
    database: Arc<dyn Database>,
    backoff: ExponentialBuilder,
    idle: Duration,
    queued: Arc<AtomicUsize>,
}

impl LaneWorker {
    async fn run(
        self,
        mut receiver: mpsc::UnboundedReceiver<LaneOp>,
        previous: Option<JoinHandle<()>>,
    ) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        loop {
            match tokio::time::timeout(self.idle, receiver.recv()).await {
                Ok(Some(op)) => self.apply(op).await,
                Ok(None) => break,
                Err(_) => {
                    receiver.close();
                    while let Some(op) = receiver.recv().await {
                        self.apply(op).await;
                    }
                    debug!(lane = %self.name, "Write lane idle, exiting");
                    break;
                }
            }
        }
    }

    async fn apply(&self, op: LaneOp) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        match op {
            LaneOp::Barrier(done) => {
                let _ = done.send(());
            }
            LaneOp::Write(write) => {
                let result = self.execute(&write).await;
                if let Err(e) = &result {
                    error!(
                        lane = %self.name,
                        key = %write.key,
                        error = %e,
                        "Background write failed"
                    );
                }
                if let Some(ack) = write.ack {
                    let _ = ack.send(result);
                }
            }
        }
    }

    async fn execute(&self, write: &PendingWrite) -> Result<()> {
        let database = &self.database;
        (|| async move {
            match write.method {
                WriteMethod::Post => database.post(write.kind, &write.key, &write.value).await,
                WriteMethod::Update => {
                    database.update(write.kind, &write.key, &write.value).await
                }
            }
        })
        .retry(self.backoff)
        .when(is_transient)
        .notify(|err: &StorageError, dur: Duration| {
            warn!(lane = %self.name, key = %write.key, error = %err, delay = ?dur, "Write failed, retrying");
        })
        .await
    }
}

/// Connection and transport failures may succeed on retry; refusals won't.
fn is_transient(error: &StorageError) -> bool {
    matches!(
        error,
        StorageError::Connection(_) | StorageError::Request { .. }
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::MockDatabase;

    const KIND: RecordKind = RecordKind::CollectionCommaIdValue;

    fn writer(db: &Arc<MockDatabase>, config: PersistenceConfig) -> WriteBehind {
        WriteBehind::new(Arc::clone(db) as Arc<dyn Database>, &config)
    }

    #[tokio::test]
    async fn test_lane_preserves_order_despite_slow_first_write() {
        let db = Arc::new(MockDatabase::new());
        db.insert_document("maps,M1", json!({"v": 0})).await;
        db.push_write_delay(Duration::from_millis(50)).await;
        let mut writer = writer(&db, PersistenceConfig::default());

        writer.update("M1", KIND, "maps,M1", json!({"v": 1}));
        writer.update("M1", KIND, "maps,M1", json!({"v": 2}));
        writer.flush("M1").await;

        assert_eq!(db.document("maps,M1").await, Some(json!({"v": 2})));
        let order: Vec<_> = db.writes().await.into_iter().map(|w| w.value).collect();
        assert_eq!(order, vec![json!({"v": 1}), json!({"v": 2})]);
    }

    #[tokio::test]
    async fn test_lanes_for_different_aggregates_run_independently() {
        let db = Arc::new(MockDatabase::new());
        db.push_write_delay(Duration::from_millis(200)).await;
        let mut writer = writer(&db, PersistenceConfig::default());

        writer.post("M1", RecordKind::Messenger, "maps_M1", json!("slow"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.post("M2", RecordKind::Messenger, "maps_M2", json!("fast"));
        writer.flush_all().await;

        let keys: Vec<_> = db.writes().await.into_iter().map(|w| w.key).collect();
        assert_eq!(keys, vec!["maps_M2", "maps_M1"]);
    }

    #[tokio::test]
    async fn test_acked_write_reports_outcome() {
        let db = Arc::new(MockDatabase::new());
        let mut writer = writer(&db, PersistenceConfig::default());

        let created = writer.post_acked("M1", KIND, "maps,M1", json!({}));
        assert!(created.wait().await.is_ok());

        let duplicate = writer.post_acked("M1", KIND, "maps,M1", json!({}));
        assert!(matches!(
            duplicate.wait().await,
            Err(StorageError::Rejected { .. })
        ));

        let missing = writer.update_acked("M2", KIND, "maps,M2", json!({}));
        assert!(matches!(
            missing.wait().await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_block_lane() {
        let db = Arc::new(MockDatabase::new());
        let mut writer = writer(&db, PersistenceConfig::default());

        writer.update("M1", KIND, "maps,M1", json!({}));
        writer.post("M1", RecordKind::Messenger, "maps_M1", json!("event"));
        writer.flush("M1").await;

        assert_eq!(db.journal("maps_M1").await, vec![json!("event")]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let db = Arc::new(MockDatabase::new());
        db.set_fail_on_post(true).await;
        let mut writer = writer(
            &db,
            PersistenceConfig {
                max_retries: 5,
                retry_min_delay_ms: 20,
                ..PersistenceConfig::default()
            },
        );

        let ack = writer.post_acked("M1", RecordKind::Messenger, "maps_M1", json!("event"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        db.set_fail_on_post(false).await;

        assert!(ack.wait().await.is_ok());
        assert_eq!(db.journal("maps_M1").await, vec![json!("event")]);
    }

    #[tokio::test]
    async fn test_no_retries_by_default() {
        let db = Arc::new(MockDatabase::new());
        db.set_fail_on_post(true).await;
        let mut writer = writer(&db, PersistenceConfig::default());

        let ack = writer.post_acked("M1", RecordKind::Messenger, "maps_M1", json!("event"));
        assert!(matches!(
            ack.wait().await,
            Err(StorageError::Connection(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_lane_exits_and_respawns() {
        let db = Arc::new(MockDatabase::new());
        let mut writer = writer(
            &db,
            PersistenceConfig {
                lane_idle_secs: 1,
                ..PersistenceConfig::default()
            },
        );

        writer.post("M1", RecordKind::Messenger, "maps_M1", json!(1));
        writer.flush("M1").await;
        assert_eq!(writer.lane_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(writer.lane_count(), 0);

        writer.post("M1", RecordKind::Messenger, "maps_M1", json!(2));
        writer.flush("M1").await;
        assert_eq!(writer.lane_count(), 1);
        assert_eq!(db.journal("maps_M1").await, vec![json!(1), json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_tracks_backlog_behind_slow_store() {
        let db = Arc::new(MockDatabase::new());
        db.push_write_delay(Duration::from_secs(60)).await;
        let mut writer = writer(
            &db,
            PersistenceConfig {
                lane_warn_depth: 2,
                ..PersistenceConfig::default()
            },
        );

        for i in 0..5 {
            writer.post("M1", RecordKind::Messenger, "maps_M1", json!(i));
        }
        assert_eq!(writer.queued("M1"), 5);

        // The writer takes the first op and stalls on it.
        for _ in 0..10 {
            if writer.queued("M1") < 5 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(writer.queued("M1"), 4);

        writer.flush("M1").await;
        assert_eq!(writer.queued("M1"), 0);
        assert_eq!(db.journal("maps_M1").await.len(), 5);
        assert_eq!(writer.queued("M2"), 0);
    }

    #[tokio::test]
    async fn test_flush_unknown_lane_returns_immediately() {
        let db = Arc::new(MockDatabase::new());
        let mut writer = writer(&db, PersistenceConfig::default());

        writer.flush("nope").await;
        writer.flush_all().await;
        assert_eq!(writer.lane_count(), 0);
    }
}
