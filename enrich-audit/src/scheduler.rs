//! Refresh scheduler
//!
//! Decides which entities are due for a service: those with no successful
//! run, or whose latest success completed at or before `now - threshold`.
//! Failed and pending logs never satisfy the window, so failures are picked
//! up again on the next pass.
//!
//! Candidate ids travel as a single JSON array parameter and are expanded
//! with `json_each`, keeping the query parameterized for any batch size.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use enrich_common::time::{from_millis, to_millis};
use enrich_common::{Clock, EntityKind, EntityRef, Result};

use crate::lifecycle::AUTOMATIC_AUDIT_SERVICE;
use crate::loader::EntityRegistry;
use crate::service_config::{ServiceConfiguration, ServiceRegistry};

/// Entity selected for a batch, with its last successful run if any
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueEntity {
    pub entity: EntityRef,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Computes refresh work from the audit trail and service policy
#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    pool: SqlitePool,
    services: ServiceRegistry,
    clock: Arc<dyn Clock>,
}

impl RefreshScheduler {
    pub fn new(pool: SqlitePool, services: ServiceRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            services,
            clock,
        }
    }

    /// Active configuration for `service_name`, or `None` if disabled
    async fn enabled_config(&self, service_name: &str) -> Result<Option<ServiceConfiguration>> {
        if service_name == AUTOMATIC_AUDIT_SERVICE {
            return Ok(None);
        }
        let config = self.services.find(service_name).await?;
        match config {
            Some(config) if config.active => Ok(Some(config)),
            _ => {
                debug!(service = service_name, "Service missing or inactive, nothing to schedule");
                Ok(None)
            }
        }
    }

    /// Subset of `candidates` due for `service_name`, in input order
    ///
    /// Returns an empty list for a missing or inactive service.
    pub async fn needing_service(
        &self,
        service_name: &str,
        candidates: &[EntityRef],
    ) -> Result<Vec<EntityRef>> {
        let service_name = service_name.trim();
        let Some(config) = self.enabled_config(service_name).await? else {
            return Ok(Vec::new());
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let cutoff = refresh_cutoff_millis(&config, self.clock.now());

        let mut by_kind: BTreeMap<EntityKind, Vec<i64>> = BTreeMap::new();
        for entity in candidates {
            by_kind.entry(entity.kind).or_default().push(entity.id);
        }

        let mut due: HashSet<EntityRef> = HashSet::new();
        for (kind, ids) in by_kind {
            let ids_json = serde_json::to_string(&ids)?;
            let rows: Vec<i64> = sqlx::query_scalar(
                r#"
                SELECT DISTINCT c.value
                FROM json_each(?) AS c
                WHERE NOT EXISTS (
                    SELECT 1 FROM service_audit_logs sal
                    WHERE sal.auditable_type = ?
                      AND sal.auditable_id = c.value
                      AND sal.service_name = ?
                      AND sal.status = 'success'
                      AND sal.completed_at > ?
                )
                "#,
            )
            .bind(ids_json)
            .bind(kind.as_str())
            .bind(service_name)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

            due.extend(rows.into_iter().map(|id| EntityRef::new(kind, id)));
        }

        let mut seen = HashSet::new();
        let result: Vec<EntityRef> = candidates
            .iter()
            .copied()
            .filter(|e| due.contains(e) && seen.insert(*e))
            .collect();

        debug!(
            service = service_name,
            candidates = candidates.len(),
            due = result.len(),
            "Computed entities needing service"
        );
        Ok(result)
    }

    /// Whether a single entity is due for `service_name`
    pub async fn needs_service(&self, service_name: &str, entity: EntityRef) -> Result<bool> {
        Ok(!self.needing_service(service_name, &[entity]).await?.is_empty())
    }

    /// Next batch of `kind` entities for `service_name`
    ///
    /// Never-run entities come first, then the oldest last success, then id.
    /// The batch is capped at the service's `batch_size`. Services whose
    /// dependencies are not all active yield an empty batch.
    pub async fn due_batch(
        &self,
        service_name: &str,
        kind: EntityKind,
        registry: &EntityRegistry,
    ) -> Result<Vec<DueEntity>> {
        let service_name = service_name.trim();
        let Some(config) = self.enabled_config(service_name).await? else {
            return Ok(Vec::new());
        };
        if !self.services.dependencies_met(service_name).await? {
            info!(service = service_name, "Dependencies not active, skipping batch");
            return Ok(Vec::new());
        }

        let ids = registry.get(kind)?.candidate_ids(None).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let cutoff = refresh_cutoff_millis(&config, self.clock.now());
        let rows = sqlx::query(
            r#"
            SELECT id, last_success_at FROM (
                SELECT DISTINCT c.value AS id,
                    (SELECT MAX(sal.completed_at) FROM service_audit_logs sal
                     WHERE sal.auditable_type = ?
                       AND sal.auditable_id = c.value
                       AND sal.service_name = ?
                       AND sal.status = 'success') AS last_success_at
                FROM json_each(?) AS c
            )
            WHERE last_success_at IS NULL OR last_success_at <= ?
            ORDER BY last_success_at IS NOT NULL, last_success_at, id
            LIMIT ?
            "#,
        )
        .bind(kind.as_str())
        .bind(service_name)
        .bind(serde_json::to_string(&ids)?)
        .bind(cutoff)
        .bind(config.batch_size)
        .fetch_all(&self.pool)
        .await?;

        let batch: Vec<DueEntity> = rows
            .iter()
            .map(|row| DueEntity {
                entity: EntityRef::new(kind, row.get("id")),
                last_success_at: row.get::<Option<i64>, _>("last_success_at").map(from_millis),
            })
            .collect();

        info!(
            service = service_name,
            kind = kind.as_str(),
            candidates = ids.len(),
            batch = batch.len(),
            "Selected refresh batch"
        );
        Ok(batch)
    }
}

/// Completion cutoff in millis; `i64::MIN` when no success ever expires
fn refresh_cutoff_millis(config: &ServiceConfiguration, now: DateTime<Utc>) -> i64 {
    config.refresh_cutoff(now).map(to_millis).unwrap_or(i64::MIN)
}
