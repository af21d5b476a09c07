//! In-process queue store
//!
//! Same semantics as the Redis store, including lock and current-job
//! expiry, for single-process deployments and tests. Expiry is evaluated
//! against the injected clock.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use enrich_common::{Clock, Result};

use super::store::{CurrentJob, LockInfo, QueueStore};
use super::QueueJob;

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<QueueJob>,
    lock: Option<(LockInfo, DateTime<Utc>)>,
    current: Option<(CurrentJob, DateTime<Utc>)>,
}

impl State {
    fn expire(&mut self, now: DateTime<Utc>) {
        if matches!(&self.lock, Some((_, expires_at)) if *expires_at <= now) {
            self.lock = None;
        }
        if matches!(&self.current, Some((_, expires_at)) if *expires_at <= now) {
            self.current = None;
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl MemoryQueueStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or_else(|| now + chrono::Duration::days(36_500))
    }

    async fn state(&self) -> tokio::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().await;
        state.expire(self.clock.now());
        state
    }
}

#[async_trait::async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push_back(&self, job: &QueueJob) -> Result<()> {
        self.state().await.queue.push_back(job.clone());
        Ok(())
    }

    async fn push_front(&self, job: &QueueJob) -> Result<()> {
        self.state().await.queue.push_front(job.clone());
        Ok(())
    }

    async fn pop_front(&self) -> Result<Option<QueueJob>> {
        Ok(self.state().await.queue.pop_front())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state().await.queue.len())
    }

    async fn contents(&self) -> Result<Vec<QueueJob>> {
        Ok(self.state().await.queue.iter().cloned().collect())
    }

    async fn remove(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state().await;
        match state.queue.iter().position(|j| j.job_id == job_id) {
            Some(index) => {
                state.queue.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<usize> {
        let mut state = self.state().await;
        let removed = state.queue.len();
        state.queue.clear();
        Ok(removed)
    }

    async fn try_acquire_lock(&self, lock: &LockInfo, ttl: Duration) -> Result<bool> {
        let expires_at = self.expiry(ttl);
        let mut state = self.state().await;
        if state.lock.is_some() {
            return Ok(false);
        }
        state.lock = Some((lock.clone(), expires_at));
        Ok(true)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.state().await.lock.as_ref().map(|(lock, _)| lock.clone()))
    }

    async fn release_lock(&self, holder_token: &str) -> Result<bool> {
        let mut state = self.state().await;
        if matches!(&state.current, Some((current, _)) if current.holder_token == holder_token) {
            state.current = None;
        }
        match &state.lock {
            Some((lock, _)) if lock.holder_token == holder_token => {
                state.lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release_lock(&self) -> Result<bool> {
        let mut state = self.state().await;
        let had_lock = state.lock.take().is_some();
        state.current = None;
        Ok(had_lock)
    }

    async fn set_current_job(&self, current: &CurrentJob, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);
        self.state().await.current = Some((current.clone(), expires_at));
        Ok(())
    }

    async fn current_job(&self) -> Result<Option<CurrentJob>> {
        Ok(self.state().await.current.as_ref().map(|(job, _)| job.clone()))
    }
}
