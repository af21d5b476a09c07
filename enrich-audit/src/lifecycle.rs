//! Lifecycle auditing
//!
//! Entity creation and updates are recorded under the reserved
//! `automatic_audit` service. Whether they are recorded at all is decided by
//! an [`AuditPolicy`] value the caller passes in; there is no process-wide
//! toggle.
//!
//! Lifecycle logs are written straight to the store and never pass through
//! the executor, so recording one cannot trigger another.

use serde_json::{json, Map, Value};
use tracing::debug;

use enrich_common::config::AuditingConfig;
use enrich_common::{EntityRef, Result};

use crate::audit_log::{AuditLogStore, NewAuditLog};

/// Service name reserved for lifecycle logs
pub const AUTOMATIC_AUDIT_SERVICE: &str = "automatic_audit";

/// Whether lifecycle events are recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditPolicy {
    pub lifecycle_enabled: bool,
}

impl AuditPolicy {
    pub const ENABLED: AuditPolicy = AuditPolicy {
        lifecycle_enabled: true,
    };

    pub const DISABLED: AuditPolicy = AuditPolicy {
        lifecycle_enabled: false,
    };
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self::ENABLED
    }
}

impl From<&AuditingConfig> for AuditPolicy {
    fn from(config: &AuditingConfig) -> Self {
        Self {
            lifecycle_enabled: config.lifecycle_enabled,
        }
    }
}

/// Entity lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Created,
    /// `changes` maps each changed field to its `[before, after]` pair
    Updated { changes: Map<String, Value> },
}

impl LifecycleEvent {
    fn operation_type(&self) -> &'static str {
        match self {
            LifecycleEvent::Created => "create",
            LifecycleEvent::Updated { .. } => "update",
        }
    }

    pub fn changed_fields(&self) -> Vec<String> {
        match self {
            LifecycleEvent::Created => Vec::new(),
            LifecycleEvent::Updated { changes } => changes.keys().cloned().collect(),
        }
    }
}

impl AuditLogStore {
    /// Record an entity lifecycle event as a completed `automatic_audit` log
    ///
    /// Returns the log id, or `None` when nothing was recorded (policy off,
    /// or an update that changed nothing).
    pub async fn record_lifecycle(
        &self,
        entity: EntityRef,
        event: LifecycleEvent,
        policy: AuditPolicy,
    ) -> Result<Option<i64>> {
        if !policy.lifecycle_enabled {
            return Ok(None);
        }
        if let LifecycleEvent::Updated { changes } = &event {
            if changes.is_empty() {
                return Ok(None);
            }
        }

        let mut metadata = Map::new();
        metadata.insert("model_class".to_string(), json!(entity.kind.as_str()));
        metadata.insert("record_id".to_string(), json!(entity.id));
        if let LifecycleEvent::Updated { changes } = &event {
            metadata.insert("changes".to_string(), Value::Object(changes.clone()));
        }

        let changed_fields = event.changed_fields();
        let log_id = self
            .create_pending(
                NewAuditLog::for_entity(entity, AUTOMATIC_AUDIT_SERVICE)
                    .operation(event.operation_type())
                    .columns(changed_fields)
                    .metadata(metadata),
            )
            .await?;
        self.mark_success(log_id, Map::new(), Vec::new()).await?;

        debug!(log_id, entity = %entity, operation = event.operation_type(), "Recorded lifecycle audit");
        Ok(Some(log_id))
    }
}
