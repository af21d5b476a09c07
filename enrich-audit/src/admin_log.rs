//! Privileged operator action log
//!
//! Forced lock releases and queue clears bypass the normal queue protocol,
//! so each one is persisted with the operator who triggered it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::warn;

use enrich_common::time::{from_millis, to_millis};
use enrich_common::{Clock, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminAction {
    pub id: i64,
    pub action: String,
    pub actor: String,
    pub target: String,
    pub details: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AdminActionLog {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl AdminActionLog {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn record(
        &self,
        action: &str,
        actor: &str,
        target: &str,
        details: Map<String, Value>,
    ) -> Result<i64> {
        if actor.trim().is_empty() {
            return Err(Error::Validation(format!("{} requires a named operator", action)));
        }

        let result = sqlx::query(
            "INSERT INTO admin_actions (action, actor, target, details, occurred_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(action)
        .bind(actor)
        .bind(target)
        .bind(serde_json::to_string(&details)?)
        .bind(to_millis(self.clock.now()))
        .execute(&self.pool)
        .await?;

        warn!(action, operator = actor, target, "Privileged action recorded");
        Ok(result.last_insert_rowid())
    }

    /// Newest first
    pub async fn recent(&self, limit: i64) -> Result<Vec<AdminAction>> {
        let rows = sqlx::query(
            "SELECT id, action, actor, target, details, occurred_at FROM admin_actions ORDER BY occurred_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let details: String = row.get("details");
                Ok(AdminAction {
                    id: row.get("id"),
                    action: row.get("action"),
                    actor: row.get("actor"),
                    target: row.get("target"),
                    details: serde_json::from_str(&details)?,
                    occurred_at: from_millis(row.get("occurred_at")),
                })
            })
            .collect()
    }
}
