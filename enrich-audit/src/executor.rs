//! Audit-scoped execution
//!
//! Wraps caller work in an audit log: a pending log is created, the work
//! runs with an [`AuditHandle`], and the log is marked success or failed
//! from the outcome. The work's own result always reaches the caller; a
//! work error is recorded and then returned unchanged.
//!
//! The executor is generic over the caller's error type. Store failures are
//! converted into it through `From<enrich_common::Error>`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use enrich_common::{EntityKind, EntityRef, Error};

use crate::audit_log::{AuditLogStore, AuditTarget, NewAuditLog, DEFAULT_OPERATION_TYPE};
use crate::lifecycle::AUTOMATIC_AUDIT_SERVICE;

/// What an audited operation is recorded as
#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub service_name: String,
    pub operation_type: String,
    pub columns_affected: Vec<String>,
    pub metadata: Map<String, Value>,
    pub job_id: Option<String>,
    pub queue_name: Option<String>,
}

impl AuditRequest {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            operation_type: DEFAULT_OPERATION_TYPE.to_string(),
            columns_affected: Vec::new(),
            metadata: Map::new(),
            job_id: None,
            queue_name: None,
        }
    }

    pub fn operation(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = operation_type.into();
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns_affected = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tag the log with the background job that runs the operation
    pub fn job(mut self, job_id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self.queue_name = Some(queue_name.into());
        self
    }

    fn into_new_log(self, target: AuditTarget) -> NewAuditLog {
        let mut log = NewAuditLog::new(target, self.service_name)
            .operation(self.operation_type)
            .columns(self.columns_affected)
            .metadata(self.metadata);
        log.job_id = self.job_id;
        log.queue_name = self.queue_name;
        log
    }
}

#[derive(Debug, Default)]
struct HandleState {
    metadata: Map<String, Value>,
    columns: Vec<String>,
}

/// Handle given to audited work for attaching results to its log
///
/// Clones share state; whatever is attached when the work finishes is
/// written with the terminal status.
#[derive(Debug, Clone)]
pub struct AuditHandle {
    log_id: i64,
    state: Arc<Mutex<HandleState>>,
}

impl AuditHandle {
    fn new(log_id: i64) -> Self {
        Self {
            log_id,
            state: Arc::new(Mutex::new(HandleState::default())),
        }
    }

    pub fn log_id(&self) -> i64 {
        self.log_id
    }

    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.metadata.insert(key.into(), value.into());
    }

    /// Record fields the work changed on the entity
    pub fn track_columns<I, S>(&self, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.columns.extend(columns.into_iter().map(Into::into));
    }

    fn take(&self) -> (Map<String, Value>, Vec<String>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let state = std::mem::take(&mut *state);
        (state.metadata, state.columns)
    }
}

/// Outcome of an isolated batch
#[derive(Debug, Serialize)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(EntityRef, T)>,
    /// Entity and error message for each failed item
    pub failed: Vec<(EntityRef, String)>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs work inside audit logs
#[derive(Debug, Clone)]
pub struct AuditExecutor {
    store: AuditLogStore,
}

impl AuditExecutor {
    pub fn new(store: AuditLogStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &AuditLogStore {
        &self.store
    }

    /// Run `work` against `entity` inside one audit log
    ///
    /// Returns the work's value after recording success, or the work's
    /// original error after recording the failure.
    pub async fn audit_service_operation<T, E, F, Fut>(
        &self,
        entity: EntityRef,
        request: AuditRequest,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(AuditHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        self.run_audited(AuditTarget::Entity(entity), request, work)
            .await
    }

    /// Like [`AuditExecutor::audit_service_operation`] for a row whose
    /// entity is not known yet. The log is a placeholder until attached.
    pub async fn audit_unresolved_operation<T, E, F, Fut>(
        &self,
        kind: EntityKind,
        table_name: &str,
        record_id: &str,
        request: AuditRequest,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(AuditHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        let target = AuditTarget::Unresolved {
            kind,
            table_name: table_name.to_string(),
            record_id: record_id.to_string(),
        };
        self.run_audited(target, request, work).await
    }

    async fn run_audited<T, E, F, Fut>(
        &self,
        target: AuditTarget,
        request: AuditRequest,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(AuditHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        if request.service_name.trim() == AUTOMATIC_AUDIT_SERVICE {
            return Err(E::from(Error::Validation(format!(
                "{} is reserved for lifecycle auditing",
                AUTOMATIC_AUDIT_SERVICE
            ))));
        }

        let service_name = request.service_name.clone();
        let log_id = self
            .store
            .create_pending(request.into_new_log(target))
            .await
            .map_err(E::from)?;

        let handle = AuditHandle::new(log_id);
        match work(handle.clone()).await {
            Ok(value) => {
                let (metadata, columns) = handle.take();
                self.store
                    .mark_success(log_id, metadata, columns)
                    .await
                    .map_err(E::from)?;
                Ok(value)
            }
            Err(err) => {
                let (metadata, columns) = handle.take();
                let message = err.to_string();
                warn!(log_id, service = %service_name, error = %message, "Audited operation failed");
                if let Err(record_err) = self.store.mark_failed(log_id, &message, metadata, columns).await {
                    error!(
                        log_id,
                        service = %service_name,
                        error = %record_err,
                        "Failed to record operation failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Audit each entity in order, stopping at the first failure
    ///
    /// Entities after the failing one are neither processed nor logged.
    pub async fn with_service_audit<T, E, F, Fut>(
        &self,
        entities: &[EntityRef],
        request: AuditRequest,
        mut work: F,
    ) -> Result<Vec<T>, E>
    where
        F: FnMut(EntityRef, AuditHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        let mut results = Vec::with_capacity(entities.len());
        for &entity in entities {
            let value = self
                .audit_service_operation(entity, request.clone(), |handle| work(entity, handle))
                .await?;
            results.push(value);
        }
        Ok(results)
    }

    /// Audit each entity independently; a failure is recorded and the batch
    /// continues
    pub async fn with_service_audit_isolated<T, E, F, Fut>(
        &self,
        entities: &[EntityRef],
        request: AuditRequest,
        mut work: F,
    ) -> BatchReport<T>
    where
        F: FnMut(EntityRef, AuditHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        let mut report = BatchReport::default();
        for &entity in entities {
            match self
                .audit_service_operation(entity, request.clone(), |handle| work(entity, handle))
                .await
            {
                Ok(value) => report.succeeded.push((entity, value)),
                Err(err) => report.failed.push((entity, err.to_string())),
            }
        }
        if !report.failed.is_empty() {
            warn!(
                service = %request.service_name,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "Batch finished with failures"
            );
        }
        report
    }
}
