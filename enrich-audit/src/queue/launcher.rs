//! Job launching
//!
//! The queue hands each dequeued job to a [`JobLauncher`]. A launcher
//! either runs the job to completion before returning, or dispatches it to
//! something that reports back later through
//! [`SequentialQueue::job_completed`](super::SequentialQueue::job_completed).

use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::info;

use enrich_common::{Error, Result};

use super::QueueJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Job finished; the lock can be released now
    Completed,
    /// Job is running elsewhere; the lock stays held until completion is
    /// reported
    Dispatched,
}

#[async_trait::async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, job: &QueueJob) -> Result<LaunchOutcome>;
}

/// Hands jobs to an in-process worker over a channel
#[derive(Debug, Clone)]
pub struct ChannelLauncher {
    sender: mpsc::Sender<QueueJob>,
    service_types: Option<HashSet<String>>,
}

impl ChannelLauncher {
    pub fn new(sender: mpsc::Sender<QueueJob>) -> Self {
        Self {
            sender,
            service_types: None,
        }
    }

    /// Reject jobs whose service type is not in `service_types`
    pub fn with_service_types<I, S>(mut self, service_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_types = Some(service_types.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait::async_trait]
impl JobLauncher for ChannelLauncher {
    async fn launch(&self, job: &QueueJob) -> Result<LaunchOutcome> {
        if let Some(types) = &self.service_types {
            if !types.contains(&job.service_type) {
                return Err(Error::Validation(format!(
                    "Unknown service type: {}",
                    job.service_type
                )));
            }
        }

        self.sender
            .send(job.clone())
            .await
            .map_err(|_| Error::External("Job worker channel is closed".to_string()))?;

        info!(
            job_id = %job.job_id,
            entity_id = job.entity_id,
            service_type = %job.service_type,
            "Dispatched queued job"
        );
        Ok(LaunchOutcome::Dispatched)
    }
}
