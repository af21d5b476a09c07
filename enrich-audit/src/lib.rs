//! # Enrichment Audit Core
//!
//! Tracks enrichment service runs against companies, domains and people and
//! decides when each entity is due again.
//!
//! - [`audit_log`]: per-run audit log with a pending → success/failed state machine
//! - [`service_config`]: per-service refresh policy registry
//! - [`scheduler`]: selects entities whose last success is outside the refresh window
//! - [`executor`]: runs caller work inside an audit log
//! - [`lifecycle`]: `automatic_audit` logs for entity create/update
//! - [`queue`]: single-flight FIFO queue for a rate-limited external service
//!
//! ```ignore
//! let executor = AuditExecutor::new(store);
//! let ok = executor
//!     .audit_service_operation(EntityRef::domain(42), AuditRequest::new("domain_dns_testing"), |log| async move {
//!         log.track_columns(["dns_status"]);
//!         Ok::<_, enrich_common::Error>(true)
//!     })
//!     .await?;
//! ```

pub mod admin_log;
pub mod audit_log;
pub mod executor;
pub mod field_map;
pub mod lifecycle;
pub mod loader;
pub mod queue;
pub mod scheduler;
pub mod service_config;

pub use audit_log::{AuditLog, AuditLogStore, AuditStatus, AuditTarget, NewAuditLog, ServiceStats};
pub use executor::{AuditExecutor, AuditHandle, AuditRequest, BatchReport};
pub use lifecycle::{AuditPolicy, LifecycleEvent, AUTOMATIC_AUDIT_SERVICE};
pub use loader::{EntityLoader, EntityRegistry, SqliteEntityLoader};
pub use scheduler::{DueEntity, RefreshScheduler};
pub use service_config::{ServiceConfiguration, ServiceRegistry};
