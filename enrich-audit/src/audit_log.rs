//! Service audit log store
//!
//! One row per service invocation against one entity. A log is created
//! `pending` and makes exactly one terminal transition to `success` or
//! `failed`; terminal logs are never modified again.
//!
//! The transition is guarded in SQL (`WHERE status = 'pending'`), so two
//! writers racing to terminalize the same log cannot both win. Callers are
//! still expected to own a log's lifecycle 1:1 with the operation that
//! created it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use enrich_common::db::retry_on_lock;
use enrich_common::time::{from_millis, to_millis};
use enrich_common::{Clock, EntityKind, EntityRef, Error, Result};

use crate::loader::EntityRegistry;

/// Longest accepted service name
pub const MAX_SERVICE_NAME_LEN: usize = 100;

/// Longest accepted operation type
pub const MAX_OPERATION_TYPE_LEN: usize = 50;

/// Operation type used when the caller does not name one
pub const DEFAULT_OPERATION_TYPE: &str = "process";

/// Metadata key marking a log whose entity is not yet resolved
pub const TEMP_AUDITABLE_KEY: &str = "temp_auditable";

/// Audit log status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuditStatus::Pending)
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(AuditStatus::Pending),
            "success" => Ok(AuditStatus::Success),
            "failed" => Ok(AuditStatus::Failed),
            other => Err(Error::Internal(format!("Unknown audit status in database: {}", other))),
        }
    }
}

/// Persisted audit log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,
    pub service_name: String,
    pub operation_type: String,
    pub auditable_type: EntityKind,
    /// `None` only while a placeholder log waits for its entity
    pub auditable_id: Option<i64>,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub columns_affected: Vec<String>,
    pub metadata: Map<String, Value>,
    pub error_message: Option<String>,
    pub table_name: String,
    pub record_id: String,
    pub job_id: Option<String>,
    pub queue_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    /// Entity this log is attached to, if resolved
    pub fn entity(&self) -> Option<EntityRef> {
        self.auditable_id
            .map(|id| EntityRef::new(self.auditable_type, id))
    }

    pub fn is_placeholder(&self) -> bool {
        self.auditable_id.is_none()
    }
}

/// What a new log is recorded against
#[derive(Debug, Clone, PartialEq)]
pub enum AuditTarget {
    /// A known entity; `table_name`/`record_id` derive from it
    Entity(EntityRef),
    /// Entity not known yet (e.g. an incoming webhook). The log records the
    /// row actually touched and is attached to an entity later.
    Unresolved {
        kind: EntityKind,
        table_name: String,
        record_id: String,
    },
}

impl AuditTarget {
    fn kind(&self) -> EntityKind {
        match self {
            AuditTarget::Entity(entity) => entity.kind,
            AuditTarget::Unresolved { kind, .. } => *kind,
        }
    }
}

/// Creation request for a pending log
#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub target: AuditTarget,
    pub service_name: String,
    pub operation_type: String,
    pub columns_affected: Vec<String>,
    pub metadata: Map<String, Value>,
    pub job_id: Option<String>,
    pub queue_name: Option<String>,
}

impl NewAuditLog {
    pub fn new(target: AuditTarget, service_name: impl Into<String>) -> Self {
        Self {
            target,
            service_name: service_name.into(),
            operation_type: DEFAULT_OPERATION_TYPE.to_string(),
            columns_affected: Vec::new(),
            metadata: Map::new(),
            job_id: None,
            queue_name: None,
        }
    }

    pub fn for_entity(entity: EntityRef, service_name: impl Into<String>) -> Self {
        Self::new(AuditTarget::Entity(entity), service_name)
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

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    fn validate(&self) -> Result<()> {
        let service = self.service_name.trim();
        if service.is_empty() {
            return Err(Error::Validation("service_name is required".to_string()));
        }
        if service.len() > MAX_SERVICE_NAME_LEN {
            return Err(Error::Validation(format!(
                "service_name exceeds {} characters",
                MAX_SERVICE_NAME_LEN
            )));
        }
        let operation = self.operation_type.trim();
        if operation.is_empty() {
            return Err(Error::Validation("operation_type is required".to_string()));
        }
        if operation.len() > MAX_OPERATION_TYPE_LEN {
            return Err(Error::Validation(format!(
                "operation_type exceeds {} characters",
                MAX_OPERATION_TYPE_LEN
            )));
        }
        if let AuditTarget::Unresolved { table_name, record_id, .. } = &self.target {
            if table_name.trim().is_empty() || record_id.trim().is_empty() {
                return Err(Error::Validation(
                    "table_name and record_id are required for unresolved logs".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Per-service aggregate over the audit trail
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStats {
    pub service_name: String,
    pub pending: i64,
    pub success: i64,
    pub failed: i64,
    pub avg_execution_time_ms: Option<f64>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl ServiceStats {
    pub fn total(&self) -> i64 {
        self.pending + self.success + self.failed
    }
}

/// Days of audit history kept by [`AuditLogStore::cleanup_old_logs`]
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// SQLite-backed audit log store
#[derive(Debug, Clone)]
pub struct AuditLogStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    max_lock_wait_ms: u64,
}

const SELECT_COLUMNS: &str = r#"
    id, service_name, operation_type, auditable_type, auditable_id, status,
    started_at, completed_at, execution_time_ms, columns_affected, metadata,
    error_message, table_name, record_id, job_id, queue_name, created_at
"#;

impl AuditLogStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            max_lock_wait_ms: 5000,
        }
    }

    /// Bound on retrying writes that hit SQLite lock contention
    pub fn with_max_lock_wait(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create a pending log and return its id
    pub async fn create_pending(&self, new_log: NewAuditLog) -> Result<i64> {
        new_log.validate()?;

        let now = to_millis(self.clock.now());
        let kind = new_log.target.kind();
        let (auditable_id, table_name, record_id) = match &new_log.target {
            AuditTarget::Entity(entity) => (
                Some(entity.id),
                entity.kind.table_name().to_string(),
                entity.id.to_string(),
            ),
            AuditTarget::Unresolved { table_name, record_id, .. } => {
                (None, table_name.clone(), record_id.clone())
            }
        };

        let mut metadata = new_log.metadata.clone();
        if auditable_id.is_none() {
            metadata.insert(TEMP_AUDITABLE_KEY.to_string(), Value::Bool(true));
        }
        let metadata = serde_json::to_string(&metadata)?;
        let columns = serde_json::to_string(&dedup_columns(new_log.columns_affected.iter().cloned()))?;

        let log_id = retry_on_lock("create_audit_log", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT INTO service_audit_logs (
                    service_name, operation_type, auditable_type, auditable_id, status,
                    started_at, columns_affected, metadata, table_name, record_id,
                    job_id, queue_name, created_at
                ) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(new_log.service_name.trim())
            .bind(new_log.operation_type.trim())
            .bind(kind.as_str())
            .bind(auditable_id)
            .bind(now)
            .bind(&columns)
            .bind(&metadata)
            .bind(&table_name)
            .bind(&record_id)
            .bind(&new_log.job_id)
            .bind(&new_log.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            Ok(result.last_insert_rowid())
        })
        .await?;

        debug!(
            log_id,
            service = %new_log.service_name,
            auditable_type = kind.as_str(),
            record_id = %record_id,
            "Created pending audit log"
        );

        Ok(log_id)
    }

    /// Create a pending placeholder log for a row whose entity is not known yet
    ///
    /// Resolve it later with [`AuditLogStore::attach_entity`].
    pub async fn create_unresolved(
        &self,
        kind: EntityKind,
        table_name: &str,
        record_id: &str,
        service_name: &str,
        operation_type: &str,
        metadata: Map<String, Value>,
    ) -> Result<i64> {
        let target = AuditTarget::Unresolved {
            kind,
            table_name: table_name.to_string(),
            record_id: record_id.to_string(),
        };
        self.create_pending(
            NewAuditLog::new(target, service_name)
                .operation(operation_type)
                .metadata(metadata),
        )
        .await
    }

    /// Terminalize as success, merging `metadata` and `columns_affected`
    pub async fn mark_success(
        &self,
        log_id: i64,
        metadata: Map<String, Value>,
        columns_affected: Vec<String>,
    ) -> Result<AuditLog> {
        self.terminalize(log_id, AuditStatus::Success, None, metadata, columns_affected)
            .await
    }

    /// Terminalize as failed, recording `error_message`
    pub async fn mark_failed(
        &self,
        log_id: i64,
        error_message: &str,
        metadata: Map<String, Value>,
        columns_affected: Vec<String>,
    ) -> Result<AuditLog> {
        self.terminalize(
            log_id,
            AuditStatus::Failed,
            Some(error_message),
            metadata,
            columns_affected,
        )
        .await
    }

    async fn terminalize(
        &self,
        log_id: i64,
        status: AuditStatus,
        error_message: Option<&str>,
        metadata: Map<String, Value>,
        columns_affected: Vec<String>,
    ) -> Result<AuditLog> {
        let now = self.clock.now();

        retry_on_lock("terminalize_audit_log", self.max_lock_wait_ms, || {
            self.terminalize_once(log_id, status, error_message, &metadata, &columns_affected, now)
        })
        .await?;

        let log = self
            .get(log_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("audit log {}", log_id)))?;

        info!(
            log_id,
            service = %log.service_name,
            status = %log.status,
            execution_time_ms = log.execution_time_ms.unwrap_or_default(),
            "Audit log completed"
        );

        Ok(log)
    }

    async fn terminalize_once(
        &self,
        log_id: i64,
        status: AuditStatus,
        error_message: Option<&str>,
        metadata: &Map<String, Value>,
        columns_affected: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, started_at, metadata, columns_affected FROM service_audit_logs WHERE id = ?",
        )
        .bind(log_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(Error::NotFound(format!("audit log {}", log_id)));
        };

        let current: AuditStatus = row.get::<String, _>("status").parse()?;
        if current.is_terminal() {
            return Err(Error::IllegalState(format!(
                "audit log {} is already {}",
                log_id, current
            )));
        }

        let started_at = from_millis(row.get("started_at"));
        let mut merged: Map<String, Value> =
            serde_json::from_str(&row.get::<String, _>("metadata"))?;
        for (key, value) in metadata {
            merged.insert(key.clone(), value.clone());
        }
        if let Some(message) = error_message {
            merged.insert("error".to_string(), Value::String(message.to_string()));
        }

        let existing: Vec<String> = serde_json::from_str(&row.get::<String, _>("columns_affected"))?;
        let columns = dedup_columns(existing.into_iter().chain(columns_affected.iter().cloned()));

        let execution_time_ms = (now - started_at).num_milliseconds().max(0);

        let result = sqlx::query(
            r#"
            UPDATE service_audit_logs
            SET status = ?, completed_at = ?, execution_time_ms = ?,
                metadata = ?, columns_affected = ?, error_message = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(to_millis(now))
        .bind(execution_time_ms)
        .bind(serde_json::to_string(&merged)?)
        .bind(serde_json::to_string(&columns)?)
        .bind(error_message)
        .bind(log_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(Error::IllegalState(format!(
                "audit log {} was terminalized concurrently",
                log_id
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Attach a placeholder log to its now-known entity
    ///
    /// The entity must resolve through `registry`; the temporary marker is
    /// removed from the metadata.
    pub async fn attach_entity(
        &self,
        log_id: i64,
        entity: EntityRef,
        registry: &EntityRegistry,
    ) -> Result<AuditLog> {
        registry.ensure_exists(entity).await?;

        let log = self
            .get(log_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("audit log {}", log_id)))?;

        if log.auditable_type != entity.kind {
            return Err(Error::Validation(format!(
                "audit log {} is for {}, not {}",
                log_id, log.auditable_type, entity.kind
            )));
        }
        if let Some(existing) = log.auditable_id {
            if existing == entity.id {
                return Ok(log);
            }
            return Err(Error::IllegalState(format!(
                "audit log {} is already attached to {}",
                log_id,
                EntityRef::new(log.auditable_type, existing)
            )));
        }

        let mut metadata = log.metadata.clone();
        metadata.remove(TEMP_AUDITABLE_KEY);
        let metadata = serde_json::to_string(&metadata)?;

        let result = retry_on_lock("attach_audit_log_entity", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE service_audit_logs
                SET auditable_id = ?, metadata = ?
                WHERE id = ? AND auditable_id IS NULL
                "#,
            )
            .bind(entity.id)
            .bind(&metadata)
            .bind(log_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if result != 1 {
            return Err(Error::IllegalState(format!(
                "audit log {} was attached concurrently",
                log_id
            )));
        }

        info!(log_id, entity = %entity, "Attached placeholder audit log to entity");

        self.get(log_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("audit log {}", log_id)))
    }

    pub async fn get(&self, log_id: i64) -> Result<Option<AuditLog>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM service_audit_logs WHERE id = ?",
            SELECT_COLUMNS
        ))
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_log).transpose()
    }

    /// Logs for one entity, newest first, optionally for one service
    pub async fn logs_for(&self, entity: EntityRef, service_name: Option<&str>) -> Result<Vec<AuditLog>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM service_audit_logs
            WHERE auditable_type = ? AND auditable_id = ?
              AND (? IS NULL OR service_name = ?)
            ORDER BY created_at DESC, id DESC
            "#,
            SELECT_COLUMNS
        ))
        .bind(entity.kind.as_str())
        .bind(entity.id)
        .bind(service_name)
        .bind(service_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log).collect()
    }

    /// Most recent successful run of `service_name` against `entity`
    pub async fn last_successful_run(
        &self,
        entity: EntityRef,
        service_name: &str,
    ) -> Result<Option<AuditLog>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM service_audit_logs
            WHERE auditable_type = ? AND auditable_id = ?
              AND service_name = ? AND status = 'success'
            ORDER BY completed_at DESC, id DESC
            LIMIT 1
            "#,
            SELECT_COLUMNS
        ))
        .bind(entity.kind.as_str())
        .bind(entity.id)
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_log).transpose()
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM service_audit_logs ORDER BY created_at DESC, id DESC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log).collect()
    }

    pub async fn service_stats(&self, service_name: &str) -> Result<ServiceStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) AS success,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                AVG(execution_time_ms) AS avg_execution_time_ms,
                MAX(CASE WHEN status = 'success' THEN completed_at END) AS last_success_at
            FROM service_audit_logs
            WHERE service_name = ?
            "#,
        )
        .bind(service_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(ServiceStats {
            service_name: service_name.to_string(),
            pending: row.get("pending"),
            success: row.get("success"),
            failed: row.get("failed"),
            avg_execution_time_ms: row.get("avg_execution_time_ms"),
            last_success_at: row.get::<Option<i64>, _>("last_success_at").map(from_millis),
        })
    }

    /// Delete logs created before `cutoff`; returns the number removed
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_ms = to_millis(cutoff);
        let removed = retry_on_lock("cleanup_audit_logs", self.max_lock_wait_ms, || async {
            let result = sqlx::query("DELETE FROM service_audit_logs WHERE created_at < ?")
                .bind(cutoff_ms)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        info!(removed, cutoff = %cutoff, "Removed old audit logs");
        Ok(removed)
    }

    /// Delete logs older than `days_to_keep` days
    pub async fn cleanup_old_logs(&self, days_to_keep: i64) -> Result<u64> {
        if days_to_keep < 0 {
            return Err(Error::Validation("days_to_keep must not be negative".to_string()));
        }
        let cutoff = self.clock.now() - Duration::days(days_to_keep);
        self.cleanup_older_than(cutoff).await
    }
}

/// Ordered set union, first occurrence wins
fn dedup_columns<I>(columns: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = BTreeSet::new();
    columns
        .into_iter()
        .filter(|c| !c.trim().is_empty())
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

fn row_to_log(row: &SqliteRow) -> Result<AuditLog> {
    let auditable_type: String = row.get("auditable_type");
    let status: String = row.get("status");
    let columns: String = row.get("columns_affected");
    let metadata: String = row.get("metadata");

    Ok(AuditLog {
        id: row.get("id"),
        service_name: row.get("service_name"),
        operation_type: row.get("operation_type"),
        auditable_type: auditable_type.parse()?,
        auditable_id: row.get("auditable_id"),
        status: status.parse()?,
        started_at: from_millis(row.get("started_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
        execution_time_ms: row.get("execution_time_ms"),
        columns_affected: serde_json::from_str(&columns)?,
        metadata: serde_json::from_str(&metadata)?,
        error_message: row.get("error_message"),
        table_name: row.get("table_name"),
        record_id: row.get("record_id"),
        job_id: row.get("job_id"),
        queue_name: row.get("queue_name"),
        created_at: from_millis(row.get("created_at")),
    })
}
