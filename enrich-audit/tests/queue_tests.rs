//! Integration tests for the sequential external-call queue
//!
//! Runs against the in-memory store with a manual clock: single-flight
//! processing, lock release on every path, completion handling, operator
//! recovery and the watchdog.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Map;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use enrich_audit::admin_log::AdminActionLog;
use enrich_audit::queue::{
    spawn_lock_watchdog, ChannelLauncher, JobLauncher, LaunchOutcome, LockInfo,
    MemoryQueueStore, ProcessOutcome, QueueJob, QueueSettings, QueueStore, SequentialQueue,
    DEFAULT_SERVICE_TYPE, WATCHDOG_OPERATOR,
};
use enrich_common::db::init::init_memory_database;
use enrich_common::{Clock, Error, ManualClock, Result};

#[derive(Debug, Clone, Copy)]
enum Mode {
    Dispatch,
    Complete,
    Fail,
}

struct RecordingLauncher {
    mode: Mode,
    launched: Mutex<Vec<QueueJob>>,
}

impl RecordingLauncher {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            launched: Mutex::new(Vec::new()),
        })
    }

    fn launched_entities(&self) -> Vec<i64> {
        self.launched.lock().unwrap().iter().map(|j| j.entity_id).collect()
    }
}

#[async_trait::async_trait]
impl JobLauncher for RecordingLauncher {
    async fn launch(&self, job: &QueueJob) -> Result<LaunchOutcome> {
        self.launched.lock().unwrap().push(job.clone());
        match self.mode {
            Mode::Dispatch => Ok(LaunchOutcome::Dispatched),
            Mode::Complete => Ok(LaunchOutcome::Completed),
            Mode::Fail => Err(Error::External("PhantomBuster API returned 429".to_string())),
        }
    }
}

struct Harness {
    queue: SequentialQueue,
    store: Arc<MemoryQueueStore>,
    launcher: Arc<RecordingLauncher>,
    admin_log: AdminActionLog,
    clock: ManualClock,
}

async fn harness_with(mode: Mode, settings: QueueSettings) -> Harness {
    let pool = init_memory_database().await.unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());

    let store = Arc::new(MemoryQueueStore::new(clock_arc.clone()));
    let launcher = RecordingLauncher::new(mode);
    let admin_log = AdminActionLog::new(pool, clock_arc.clone());
    let queue = SequentialQueue::new(
        "phantombuster",
        store.clone(),
        launcher.clone(),
        admin_log.clone(),
        clock_arc,
        settings,
    );

    Harness {
        queue,
        store,
        launcher,
        admin_log,
        clock,
    }
}

async fn harness(mode: Mode) -> Harness {
    harness_with(mode, QueueSettings::default()).await
}

async fn enqueue(h: &Harness, entity_id: i64) -> Uuid {
    h.queue
        .enqueue(entity_id, DEFAULT_SERVICE_TYPE, Map::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_enqueue_starts_processing_when_idle() {
    let h = harness(Mode::Dispatch).await;

    let job_id = enqueue(&h, 15).await;

    assert_eq!(h.launcher.launched_entities(), vec![15]);
    let status = h.queue.queue_status().await.unwrap();
    assert!(status.is_processing);
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.current_job.map(|j| j.job_id), Some(job_id));
    assert_eq!(status.lock_timestamp, Some(h.clock.now()));
    assert!(!status.is_stuck);
}

#[tokio::test]
async fn test_jobs_run_one_at_a_time_in_fifo_order() {
    let h = harness(Mode::Dispatch).await;

    let first = enqueue(&h, 1).await;
    let second = enqueue(&h, 2).await;
    let _third = enqueue(&h, 3).await;

    // Only the first is in flight
    assert_eq!(h.launcher.launched_entities(), vec![1]);
    assert_eq!(h.queue.queue_status().await.unwrap().queue_length, 2);

    let outcome = h.queue.job_completed(first, "finished").await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Dispatched(ref job) if job.job_id == second));
    assert_eq!(h.launcher.launched_entities(), vec![1, 2]);

    h.queue.job_completed(second, "finished").await.unwrap();
    assert_eq!(h.launcher.launched_entities(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_completion_of_last_job_leaves_queue_idle() {
    let h = harness(Mode::Dispatch).await;
    let job_id = enqueue(&h, 1).await;

    let outcome = h.queue.job_completed(job_id, "finished").await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Idle);
    let status = h.queue.queue_status().await.unwrap();
    assert!(!status.is_processing);
    assert!(status.current_job.is_none());
}

#[tokio::test]
async fn test_stale_completion_is_ignored() {
    let h = harness(Mode::Dispatch).await;
    enqueue(&h, 1).await;
    enqueue(&h, 2).await;

    let outcome = h.queue.job_completed(Uuid::new_v4(), "finished").await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Busy);
    assert!(h.queue.queue_status().await.unwrap().is_processing);
    assert_eq!(h.launcher.launched_entities(), vec![1]);
}

#[tokio::test]
async fn test_completed_launch_releases_lock_immediately() {
    let h = harness(Mode::Complete).await;

    enqueue(&h, 1).await;
    enqueue(&h, 2).await;

    assert_eq!(h.launcher.launched_entities(), vec![1, 2]);
    assert!(!h.queue.queue_status().await.unwrap().is_processing);
}

#[tokio::test]
async fn test_launch_failure_releases_lock() {
    let h = harness(Mode::Fail).await;
    let job = QueueJob::new(8, DEFAULT_SERVICE_TYPE, Map::new(), h.clock.now());
    h.store.push_back(&job).await.unwrap();

    let outcome = h.queue.process_next_job().await.unwrap();

    match outcome {
        ProcessOutcome::LaunchFailed { job: failed, error } => {
            assert_eq!(failed.job_id, job.job_id);
            assert!(error.contains("429"));
        }
        other => panic!("expected launch failure, got {:?}", other),
    }
    let status = h.queue.queue_status().await.unwrap();
    assert!(!status.is_processing);
    assert!(status.current_job.is_none());

    // The next job can still run
    enqueue(&h, 9).await;
    assert_eq!(h.launcher.launched_entities(), vec![8, 9]);
}

#[tokio::test]
async fn test_empty_queue_releases_lock() {
    let h = harness(Mode::Dispatch).await;

    assert_eq!(h.queue.process_next_job().await.unwrap(), ProcessOutcome::Idle);
    assert!(!h.queue.queue_status().await.unwrap().is_processing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_processing_has_single_winner() {
    let h = harness(Mode::Dispatch).await;
    for entity_id in 1..=5 {
        let job = QueueJob::new(entity_id, DEFAULT_SERVICE_TYPE, Map::new(), h.clock.now());
        h.store.push_back(&job).await.unwrap();
    }

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let queue = h.queue.clone();
        tasks.spawn(async move { queue.process_next_job().await.unwrap() });
    }

    let mut dispatched = 0;
    let mut busy = 0;
    while let Some(outcome) = tasks.join_next().await {
        match outcome.unwrap() {
            ProcessOutcome::Dispatched(_) => dispatched += 1,
            ProcessOutcome::Busy => busy += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(dispatched, 1);
    assert_eq!(busy, 15);
    assert_eq!(h.launcher.launched_entities(), vec![1]);
    assert_eq!(h.queue.queue_status().await.unwrap().queue_length, 4);
}

#[tokio::test]
async fn test_force_release_always_clears_processing() {
    let h = harness(Mode::Dispatch).await;

    // Nothing held
    assert!(!h.queue.force_release_lock("ops@acme.no").await.unwrap());
    assert!(!h.queue.queue_status().await.unwrap().is_processing);

    enqueue(&h, 1).await;
    enqueue(&h, 2).await;
    assert!(h.queue.force_release_lock("ops@acme.no").await.unwrap());

    let status = h.queue.queue_status().await.unwrap();
    assert!(!status.is_processing);
    assert!(status.current_job.is_none());
    // Waiting jobs stay queued
    assert_eq!(status.queue_length, 1);

    let actions = h.admin_log.recent(10).await.unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].action, "force_release_lock");
    assert_eq!(actions[0].actor, "ops@acme.no");
    assert_eq!(actions[0].target, "phantombuster");
    assert_eq!(actions[0].details["had_lock"], serde_json::json!(true));
    assert_eq!(actions[0].details["current_entity_id"], serde_json::json!(1));
}

#[tokio::test]
async fn test_force_release_requires_operator() {
    let h = harness(Mode::Dispatch).await;

    let result = h.queue.force_release_lock("  ").await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_clear_queue_drops_jobs_and_lock() {
    let h = harness(Mode::Dispatch).await;
    for entity_id in 1..=3 {
        enqueue(&h, entity_id).await;
    }

    let removed = h.queue.clear_queue("ops@acme.no").await.unwrap();

    assert_eq!(removed, 2);
    let status = h.queue.queue_status().await.unwrap();
    assert_eq!(status.queue_length, 0);
    assert!(!status.is_processing);

    let actions = h.admin_log.recent(1).await.unwrap();
    assert_eq!(actions[0].action, "clear_queue");
    assert_eq!(actions[0].details["jobs_removed"], serde_json::json!(2));
}

#[tokio::test]
async fn test_queue_inspection_and_removal() {
    let h = harness(Mode::Dispatch).await;
    enqueue(&h, 1).await;
    let waiting_a = enqueue(&h, 7).await;
    enqueue(&h, 8).await;
    enqueue(&h, 7).await;

    assert_eq!(h.queue.queue_position(7).await.unwrap(), Some(1));
    assert_eq!(h.queue.queue_position(8).await.unwrap(), Some(2));
    assert_eq!(h.queue.queue_position(1).await.unwrap(), None);
    assert!(h.queue.has_jobs_for(8).await.unwrap());

    assert!(h.queue.remove_job(waiting_a).await.unwrap());
    assert!(!h.queue.remove_job(waiting_a).await.unwrap());

    let contents: Vec<i64> = h
        .queue
        .queue_contents()
        .await
        .unwrap()
        .iter()
        .map(|j| j.entity_id)
        .collect();
    assert_eq!(contents, vec![8, 7]);
    assert_eq!(h.queue.queue_position(7).await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_expired_lock_lets_next_worker_proceed() {
    let h = harness(Mode::Dispatch).await;
    enqueue(&h, 1).await;
    enqueue(&h, 2).await;

    h.clock.advance(ChronoDuration::minutes(29));
    assert_eq!(h.queue.process_next_job().await.unwrap(), ProcessOutcome::Busy);

    // Holder never reported back; the 30 minute TTL expires the lock
    h.clock.advance(ChronoDuration::minutes(1));
    let outcome = h.queue.process_next_job().await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Dispatched(ref job) if job.entity_id == 2));
}

#[tokio::test]
async fn test_recover_releases_stuck_lock() {
    let settings = QueueSettings {
        lock_ttl: Duration::from_secs(2 * 60 * 60),
        max_job_duration: Duration::from_secs(30 * 60),
        watchdog_interval: Duration::from_secs(60),
    };
    let h = harness_with(Mode::Dispatch, settings).await;
    enqueue(&h, 1).await;
    enqueue(&h, 2).await;

    h.clock.advance(ChronoDuration::minutes(10));
    assert_eq!(h.queue.recover().await.unwrap(), None);

    h.clock.advance(ChronoDuration::minutes(20));
    let status = h.queue.queue_status().await.unwrap();
    assert!(status.is_stuck);
    assert_eq!(status.lock_age_secs, Some(30 * 60));

    let outcome = h.queue.recover().await.unwrap();
    assert!(matches!(outcome, Some(ProcessOutcome::Dispatched(ref job)) if job.entity_id == 2));
    assert_eq!(h.admin_log.recent(1).await.unwrap()[0].actor, WATCHDOG_OPERATOR);
}

/// Runs past the lock TTL, during which another worker takes the lock
struct OverrunLauncher {
    clock: ManualClock,
    other_worker: SequentialQueue,
    other_outcome: Mutex<Option<ProcessOutcome>>,
}

#[async_trait::async_trait]
impl JobLauncher for OverrunLauncher {
    async fn launch(&self, _job: &QueueJob) -> Result<LaunchOutcome> {
        self.clock.advance(ChronoDuration::minutes(31));
        let outcome = self.other_worker.process_next_job().await?;
        *self.other_outcome.lock().unwrap() = Some(outcome);
        Ok(LaunchOutcome::Completed)
    }
}

#[tokio::test]
async fn test_overrunning_worker_leaves_new_holder_intact() {
    let h = harness(Mode::Dispatch).await;
    let overrun = Arc::new(OverrunLauncher {
        clock: h.clock.clone(),
        other_worker: h.queue.clone(),
        other_outcome: Mutex::new(None),
    });
    let slow_worker = SequentialQueue::new(
        "phantombuster",
        h.store.clone(),
        overrun.clone(),
        h.admin_log.clone(),
        Arc::new(h.clock.clone()),
        QueueSettings::default(),
    );
    for entity_id in [1, 2] {
        let job = QueueJob::new(entity_id, DEFAULT_SERVICE_TYPE, Map::new(), h.clock.now());
        h.store.push_back(&job).await.unwrap();
    }

    let outcome = slow_worker.process_next_job().await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed(ref job) if job.entity_id == 1));

    let second = match overrun.other_outcome.lock().unwrap().take() {
        Some(ProcessOutcome::Dispatched(job)) => job,
        other => panic!("expected the second worker to dispatch, got {:?}", other),
    };
    assert_eq!(second.entity_id, 2);

    // The slow worker's release must not touch the second worker's job
    let status = h.queue.queue_status().await.unwrap();
    assert!(status.is_processing);
    assert_eq!(status.current_job.map(|j| j.job_id), Some(second.job_id));

    assert_eq!(h.queue.job_completed(second.job_id, "finished").await.unwrap(), ProcessOutcome::Idle);
    let status = h.queue.queue_status().await.unwrap();
    assert!(!status.is_processing);
    assert!(status.current_job.is_none());
}

#[tokio::test]
async fn test_lock_of_unknown_age_is_not_stuck() {
    let h = harness(Mode::Dispatch).await;
    let foreign = LockInfo {
        holder_token: "not-a-queue-token".to_string(),
        acquired_at: None,
    };
    assert!(h
        .store
        .try_acquire_lock(&foreign, Duration::from_secs(2 * 60 * 60))
        .await
        .unwrap());
    h.clock.advance(ChronoDuration::minutes(45));

    let status = h.queue.queue_status().await.unwrap();
    assert!(status.is_processing);
    assert!(status.lock_timestamp.is_none());
    assert!(status.lock_age_secs.is_none());
    assert!(!status.is_stuck);

    // The watchdog leaves a lock it cannot date alone
    assert_eq!(h.queue.recover().await.unwrap(), None);
    assert!(h.queue.queue_status().await.unwrap().is_processing);
    assert!(h.admin_log.recent(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recover_kicks_idle_queue() {
    let h = harness(Mode::Dispatch).await;
    let job = QueueJob::new(4, DEFAULT_SERVICE_TYPE, Map::new(), h.clock.now());
    h.store.push_back(&job).await.unwrap();

    let outcome = h.queue.recover().await.unwrap();
    assert!(matches!(outcome, Some(ProcessOutcome::Dispatched(_))));
    assert_eq!(h.launcher.launched_entities(), vec![4]);
}

#[tokio::test]
async fn test_watchdog_recovers_until_cancelled() {
    let settings = QueueSettings {
        lock_ttl: Duration::from_secs(2 * 60 * 60),
        max_job_duration: Duration::from_secs(30 * 60),
        watchdog_interval: Duration::from_millis(10),
    };
    let h = harness_with(Mode::Dispatch, settings).await;
    enqueue(&h, 1).await;
    enqueue(&h, 2).await;
    h.clock.advance(ChronoDuration::minutes(45));

    let cancel_token = CancellationToken::new();
    let handle = spawn_lock_watchdog(
        h.queue.clone(),
        settings.watchdog_interval,
        cancel_token.clone(),
    );

    let mut recovered = false;
    for _ in 0..100 {
        if h.launcher.launched_entities() == vec![1, 2] {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(recovered, "watchdog did not restart the queue");

    cancel_token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_channel_launcher_hands_job_to_worker() {
    let pool = init_memory_database().await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
    let (sender, mut receiver) = tokio::sync::mpsc::channel(8);
    let launcher = ChannelLauncher::new(sender).with_service_types([DEFAULT_SERVICE_TYPE]);
    let queue = SequentialQueue::new(
        "phantombuster",
        Arc::new(MemoryQueueStore::new(clock.clone())),
        Arc::new(launcher),
        AdminActionLog::new(pool, clock.clone()),
        clock,
        QueueSettings::default(),
    );

    let job_id = queue.enqueue(42, DEFAULT_SERVICE_TYPE, Map::new()).await.unwrap();
    let received = receiver.recv().await.unwrap();
    assert_eq!(received.job_id, job_id);
    assert_eq!(received.entity_id, 42);

    queue.job_completed(job_id, "finished").await.unwrap();

    // Unknown service types are rejected at launch
    queue.enqueue(43, "company_scrape", Map::new()).await.unwrap();
    assert!(!queue.queue_status().await.unwrap().is_processing);
    assert!(receiver.try_recv().is_err());
}
