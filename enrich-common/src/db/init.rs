//! Database initialization
//!
//! Opens (or creates) the SQLite database and creates the audit schema.
//! Every statement is idempotent, so calling this on an existing database is
//! safe and is how upgrades pick up new tables and indexes.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // WAL allows concurrent readers with one writer; several workers write
    // audit logs at once, so keep a short busy timeout and let retry_on_lock
    // handle longer contention.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(250));

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// In-memory database with the full schema
///
/// Limited to one connection: each SQLite in-memory connection is its own
/// database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every table and index used by the audit core
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_service_audit_logs_table(pool).await?;
    create_service_configurations_table(pool).await?;
    create_admin_actions_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the service_audit_logs table
///
/// One row per service invocation against one entity. `auditable_id` is NULL
/// only for placeholder logs whose entity is resolved later; `table_name` and
/// `record_id` are always populated. The CHECK constraints encode the
/// terminal-state rules: `completed_at` is set iff the status is terminal and
/// `error_message` is set iff the status is failed.
pub async fn create_service_audit_logs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS service_audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service_name TEXT NOT NULL CHECK (length(service_name) BETWEEN 1 AND 100),
            operation_type TEXT NOT NULL DEFAULT 'process' CHECK (length(operation_type) BETWEEN 1 AND 50),
            auditable_type TEXT NOT NULL,
            auditable_id INTEGER,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'success', 'failed')),
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            execution_time_ms INTEGER,
            columns_affected TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            error_message TEXT,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            job_id TEXT,
            queue_name TEXT,
            created_at INTEGER NOT NULL,
            CHECK ((status = 'pending') = (completed_at IS NULL)),
            CHECK ((status = 'failed') = (error_message IS NOT NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Serves the scheduler's NOT EXISTS lookup
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_audit_logs_auditable_service
        ON service_audit_logs(auditable_type, auditable_id, service_name, status, completed_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_audit_logs_service_status_created
        ON service_audit_logs(service_name, status, created_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON service_audit_logs(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the service_configurations table
///
/// One row per service; operators manage it, the core only reads it.
pub async fn create_service_configurations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS service_configurations (
            service_name TEXT PRIMARY KEY CHECK (length(service_name) BETWEEN 1 AND 100),
            active INTEGER NOT NULL DEFAULT 1,
            refresh_interval_hours INTEGER NOT NULL DEFAULT 720 CHECK (refresh_interval_hours >= 0),
            batch_size INTEGER NOT NULL DEFAULT 1000 CHECK (batch_size > 0),
            retry_attempts INTEGER NOT NULL DEFAULT 3 CHECK (retry_attempts >= 0),
            depends_on_services TEXT NOT NULL DEFAULT '[]',
            settings TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the admin_actions table
///
/// Privileged operator actions (forced lock release, queue clearing).
pub async fn create_admin_actions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS admin_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            actor TEXT NOT NULL,
            target TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT '{}',
            occurred_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_admin_actions_occurred ON admin_actions(occurred_at)")
        .execute(pool)
        .await?;

    Ok(())
}
