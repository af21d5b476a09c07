//! Shared queue state
//!
//! The queue list, the processing lock and the current-job record live in
//! shared fast storage so every worker process sees the same state. Lock
//! acquisition must be an atomic set-if-absent; release compares the
//! holder token before deleting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use enrich_common::Result;

use super::QueueJob;

/// Value held by the processing lock
///
/// `acquired_at` is `None` only when a store reads back a lock value it
/// cannot decode; such a lock is held but its age is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_token: String,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
}

/// Job currently holding the lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentJob {
    pub job: QueueJob,
    /// Token of the lock taken for this job, used to release it on completion
    pub holder_token: String,
    pub started_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Append to the tail
    async fn push_back(&self, job: &QueueJob) -> Result<()>;

    /// Put a job back at the head
    async fn push_front(&self, job: &QueueJob) -> Result<()>;

    async fn pop_front(&self) -> Result<Option<QueueJob>>;

    async fn len(&self) -> Result<usize>;

    /// Snapshot of queued jobs, head first
    async fn contents(&self) -> Result<Vec<QueueJob>>;

    /// Remove one job by id; false if it was not queued
    async fn remove(&self, job_id: Uuid) -> Result<bool>;

    /// Drop every queued job; returns how many were removed
    async fn clear(&self) -> Result<usize>;

    /// Take the lock if nobody holds it; it expires after `ttl`
    async fn try_acquire_lock(&self, lock: &LockInfo, ttl: Duration) -> Result<bool>;

    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Release the lock only if `holder_token` still holds it
    ///
    /// The current-job record is deleted in the same atomic step, and only
    /// if it carries `holder_token`; a later holder's record survives.
    /// Returns whether the lock was released.
    async fn release_lock(&self, holder_token: &str) -> Result<bool>;

    /// Delete the lock and current-job record unconditionally; returns
    /// whether a lock was held
    async fn force_release_lock(&self) -> Result<bool>;

    async fn set_current_job(&self, current: &CurrentJob, ttl: Duration) -> Result<()>;

    async fn current_job(&self) -> Result<Option<CurrentJob>>;
}
