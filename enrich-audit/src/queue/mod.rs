//! Sequential external-call queue
//!
//! FIFO queue in front of an external service that can run only one job at
//! a time system-wide. Any number of producers may enqueue; a job is popped
//! and launched only by the worker holding the shared processing lock.
//!
//! The lock is released on every exit path of [`SequentialQueue::process_next_job`]
//! except a successful dispatch, where it is held until
//! [`SequentialQueue::job_completed`]. A crash in between is covered by the
//! lock TTL and by the watchdog, which force-releases locks older than the
//! maximum job duration.

pub mod launcher;
pub mod memory;
pub mod redis_store;
pub mod store;
pub mod watchdog;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use enrich_common::config::QueueConfig;
use enrich_common::{Clock, Result};

use crate::admin_log::AdminActionLog;

pub use launcher::{ChannelLauncher, JobLauncher, LaunchOutcome};
pub use memory::MemoryQueueStore;
pub use redis_store::RedisQueueStore;
pub use store::{CurrentJob, LockInfo, QueueStore};
pub use watchdog::spawn_lock_watchdog;

/// Service type used when the producer does not name one
pub const DEFAULT_SERVICE_TYPE: &str = "profile_extraction";

/// Operator name recorded for watchdog recoveries
pub const WATCHDOG_OPERATOR: &str = "watchdog";

/// Queued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: Uuid,
    pub entity_id: i64,
    pub service_type: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl QueueJob {
    pub fn new(
        entity_id: i64,
        service_type: impl Into<String>,
        options: Map<String, Value>,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            entity_id,
            service_type: service_type.into(),
            queued_at,
            options,
        }
    }
}

/// Point-in-time view of the queue; fields are read separately and may be
/// slightly inconsistent under concurrent mutation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_processing: bool,
    pub current_job: Option<QueueJob>,
    pub lock_timestamp: Option<DateTime<Utc>>,
    pub lock_age_secs: Option<i64>,
    /// Lock held for at least the maximum job duration; never set for a
    /// lock whose age is unknown
    pub is_stuck: bool,
}

/// Result of one [`SequentialQueue::process_next_job`] attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Another worker holds the lock
    Busy,
    /// Lock acquired but the queue was empty
    Idle,
    /// Job handed off; lock held until completion is reported
    Dispatched(QueueJob),
    /// Job ran to completion; lock released
    Completed(QueueJob),
    /// Launch failed; lock released and the job dropped
    LaunchFailed { job: QueueJob, error: String },
}

/// Queue timing settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    pub lock_ttl: Duration,
    pub max_job_duration: Duration,
    pub watchdog_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            max_job_duration: Duration::from_secs(config.max_job_duration_secs),
            watchdog_interval: Duration::from_secs(config.watchdog_interval_secs),
        }
    }
}

#[derive(Clone)]
pub struct SequentialQueue {
    name: String,
    store: Arc<dyn QueueStore>,
    launcher: Arc<dyn JobLauncher>,
    admin_log: AdminActionLog,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl std::fmt::Debug for SequentialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialQueue")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish()
    }
}

impl SequentialQueue {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn QueueStore>,
        launcher: Arc<dyn JobLauncher>,
        admin_log: AdminActionLog,
        clock: Arc<dyn Clock>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            launcher,
            admin_log,
            clock,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Append a job; starts processing if no job is in flight
    ///
    /// The job id is returned once the job is queued, even if the follow-up
    /// processing attempt fails.
    pub async fn enqueue(
        &self,
        entity_id: i64,
        service_type: &str,
        options: Map<String, Value>,
    ) -> Result<Uuid> {
        let job = QueueJob::new(entity_id, service_type, options, self.clock.now());
        self.store.push_back(&job).await?;
        info!(
            queue = %self.name,
            job_id = %job.job_id,
            entity_id,
            service_type,
            "Enqueued job"
        );

        if self.store.lock_info().await?.is_some() {
            debug!(queue = %self.name, "Job in flight, new job waits in queue");
            return Ok(job.job_id);
        }

        match self.process_next_job().await {
            Ok(outcome) => debug!(queue = %self.name, ?outcome, "Processing attempt after enqueue"),
            Err(e) => warn!(queue = %self.name, error = %e, "Processing attempt after enqueue failed"),
        }
        Ok(job.job_id)
    }

    /// Try to take the lock and launch the head job
    ///
    /// Lock contention is a normal [`ProcessOutcome::Busy`], not an error.
    pub async fn process_next_job(&self) -> Result<ProcessOutcome> {
        let holder_token = Uuid::new_v4().to_string();
        let acquired_at = self.clock.now();
        let lock = LockInfo {
            holder_token: holder_token.clone(),
            acquired_at: Some(acquired_at),
        };
        if !self.store.try_acquire_lock(&lock, self.settings.lock_ttl).await? {
            debug!(queue = %self.name, "Processing lock held elsewhere");
            return Ok(ProcessOutcome::Busy);
        }

        let result = self.run_locked(&holder_token, acquired_at).await;
        if !matches!(result, Ok(ProcessOutcome::Dispatched(_))) {
            self.release(&holder_token).await;
        }
        result
    }

    async fn run_locked(
        &self,
        holder_token: &str,
        acquired_at: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        let Some(job) = self.store.pop_front().await? else {
            debug!(queue = %self.name, "Queue empty");
            return Ok(ProcessOutcome::Idle);
        };

        let current = CurrentJob {
            job: job.clone(),
            holder_token: holder_token.to_string(),
            started_at: acquired_at,
        };
        if let Err(e) = self.store.set_current_job(&current, self.settings.lock_ttl).await {
            // Not started yet, so put it back where it was
            if let Err(requeue_err) = self.store.push_front(&job).await {
                error!(queue = %self.name, job_id = %job.job_id, error = %requeue_err, "Failed to requeue job");
            }
            return Err(e);
        }

        info!(queue = %self.name, job_id = %job.job_id, entity_id = job.entity_id, "Launching job");
        match self.launcher.launch(&job).await {
            Ok(LaunchOutcome::Dispatched) => Ok(ProcessOutcome::Dispatched(job)),
            Ok(LaunchOutcome::Completed) => {
                info!(queue = %self.name, job_id = %job.job_id, "Job completed");
                Ok(ProcessOutcome::Completed(job))
            }
            Err(e) => {
                error!(queue = %self.name, job_id = %job.job_id, error = %e, "Failed to launch job");
                Ok(ProcessOutcome::LaunchFailed {
                    job,
                    error: e.to_string(),
                })
            }
        }
    }

    async fn release(&self, holder_token: &str) {
        match self.store.release_lock(holder_token).await {
            Ok(true) => debug!(queue = %self.name, "Released processing lock"),
            Ok(false) => warn!(queue = %self.name, "Processing lock was no longer ours"),
            Err(e) => warn!(queue = %self.name, error = %e, "Failed to release processing lock, TTL will expire it"),
        }
    }

    /// Report that a dispatched job finished, then start the next one
    ///
    /// A job id that is not the current job is ignored apart from the
    /// follow-up processing attempt.
    pub async fn job_completed(&self, job_id: Uuid, status: &str) -> Result<ProcessOutcome> {
        match self.store.current_job().await? {
            Some(current) if current.job.job_id == job_id => {
                if self.store.release_lock(&current.holder_token).await? {
                    info!(queue = %self.name, %job_id, status, "Dispatched job completed");
                } else {
                    warn!(queue = %self.name, %job_id, status, "Dispatched job completed after its lock expired");
                }
            }
            Some(current) => {
                warn!(
                    queue = %self.name,
                    %job_id,
                    current_job_id = %current.job.job_id,
                    "Completion for a job that is not current, ignoring"
                );
            }
            None => {
                warn!(queue = %self.name, %job_id, "Completion reported with no current job");
            }
        }

        self.process_next_job().await
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let queue_length = self.store.len().await?;
        let lock = self.store.lock_info().await?;
        let current = self.store.current_job().await?;

        let now = self.clock.now();
        // Unknown age for a lock value the store could not decode
        let lock_age = lock.as_ref().and_then(|l| l.acquired_at).map(|at| now - at);
        let max_duration = ChronoDuration::from_std(self.settings.max_job_duration)
            .unwrap_or_else(|_| ChronoDuration::days(36_500));
        let is_stuck = lock_age.map(|age| age >= max_duration).unwrap_or(false);

        Ok(QueueStatus {
            queue_length,
            is_processing: lock.is_some(),
            current_job: current.map(|c| c.job),
            lock_timestamp: lock.and_then(|l| l.acquired_at),
            lock_age_secs: lock_age.map(|age| age.num_seconds()),
            is_stuck,
        })
    }

    pub async fn queue_contents(&self) -> Result<Vec<QueueJob>> {
        self.store.contents().await
    }

    pub async fn remove_job(&self, job_id: Uuid) -> Result<bool> {
        let removed = self.store.remove(job_id).await?;
        if removed {
            info!(queue = %self.name, %job_id, "Removed job from queue");
        }
        Ok(removed)
    }

    pub async fn has_jobs_for(&self, entity_id: i64) -> Result<bool> {
        Ok(self.queue_position(entity_id).await?.is_some())
    }

    /// 1-based position of the first queued job for `entity_id`
    pub async fn queue_position(&self, entity_id: i64) -> Result<Option<usize>> {
        Ok(self
            .store
            .contents()
            .await?
            .iter()
            .position(|job| job.entity_id == entity_id)
            .map(|index| index + 1))
    }

    /// Release the lock regardless of holder
    ///
    /// Privileged: recorded in the admin action log under `operator`.
    pub async fn force_release_lock(&self, operator: &str) -> Result<bool> {
        let lock = self.store.lock_info().await?;
        let current = self.store.current_job().await?;
        let had_lock = self.store.force_release_lock().await?;

        warn!(queue = %self.name, operator, had_lock, "Forcefully released processing lock");
        self.admin_log
            .record("force_release_lock", operator, &self.name, lock_details(lock, current))
            .await?;
        Ok(had_lock)
    }

    /// Drop every queued job and release the lock; returns jobs removed
    pub async fn clear_queue(&self, operator: &str) -> Result<usize> {
        let lock = self.store.lock_info().await?;
        let current = self.store.current_job().await?;
        let removed = self.store.clear().await?;
        self.store.force_release_lock().await?;

        warn!(queue = %self.name, operator, removed, "Cleared queue and released lock");
        let mut details = lock_details(lock, current);
        details.insert("jobs_removed".to_string(), json!(removed));
        self.admin_log
            .record("clear_queue", operator, &self.name, details)
            .await?;
        Ok(removed)
    }

    /// Force-release the lock and start the next job
    pub async fn restart_queue(&self, operator: &str) -> Result<ProcessOutcome> {
        self.force_release_lock(operator).await?;
        self.process_next_job().await
    }

    /// Recover from a stuck lock or an idle queue with waiting jobs
    ///
    /// Returns the processing outcome when an attempt was made.
    pub async fn recover(&self) -> Result<Option<ProcessOutcome>> {
        let status = self.queue_status().await?;
        if status.is_stuck {
            warn!(
                queue = %self.name,
                lock_age_secs = status.lock_age_secs.unwrap_or_default(),
                "Processing lock is stuck, releasing"
            );
            return self.restart_queue(WATCHDOG_OPERATOR).await.map(Some);
        }
        if !status.is_processing && status.queue_length > 0 {
            debug!(queue = %self.name, queued = status.queue_length, "Queue idle with waiting jobs");
            return self.process_next_job().await.map(Some);
        }
        Ok(None)
    }
}

fn lock_details(lock: Option<LockInfo>, current: Option<CurrentJob>) -> Map<String, Value> {
    let mut details = Map::new();
    details.insert("had_lock".to_string(), json!(lock.is_some()));
    if let Some(lock) = lock {
        details.insert("holder_token".to_string(), json!(lock.holder_token));
        details.insert(
            "lock_acquired_at".to_string(),
            json!(lock.acquired_at.map(|at| at.to_rfc3339())),
        );
    }
    if let Some(current) = current {
        details.insert("current_job_id".to_string(), json!(current.job.job_id.to_string()));
        details.insert("current_entity_id".to_string(), json!(current.job.entity_id));
    }
    details
}
