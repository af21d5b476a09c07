//! Unit tests for database initialization
//!
//! Covers automatic creation, idempotent re-open and the CHECK constraints
//! that back the audit log terminal-state rules.

use enrich_common::db::init::{init_database, init_memory_database, SCHEMA_VERSION};
use tempfile::TempDir;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("data").join("audit.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("audit.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    // Second open re-runs the idempotent schema statements
    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());

    let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(&pool2.unwrap())
        .await
        .unwrap();
    assert_eq!(versions, 1);
}

#[tokio::test]
async fn test_all_tables_created() {
    let pool = init_memory_database().await.unwrap();

    for table in ["schema_version", "service_audit_logs", "service_configurations", "admin_actions"] {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(exists, "table {} missing", table);
    }

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn test_terminal_status_requires_completed_at() {
    let pool = init_memory_database().await.unwrap();

    // success without completed_at violates the CHECK constraint
    let result = sqlx::query(
        r#"
        INSERT INTO service_audit_logs
            (service_name, operation_type, auditable_type, auditable_id, status,
             started_at, table_name, record_id, created_at)
        VALUES ('svc', 'process', 'Company', 1, 'success', 0, 'companies', '1', 0)
        "#,
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_failed_status_requires_error_message() {
    let pool = init_memory_database().await.unwrap();

    let result = sqlx::query(
        r#"
        INSERT INTO service_audit_logs
            (service_name, operation_type, auditable_type, auditable_id, status,
             started_at, completed_at, table_name, record_id, created_at)
        VALUES ('svc', 'process', 'Company', 1, 'failed', 0, 5, 'companies', '1', 0)
        "#,
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_service_configuration_batch_size_must_be_positive() {
    let pool = init_memory_database().await.unwrap();

    let result = sqlx::query(
        r#"
        INSERT INTO service_configurations (service_name, batch_size, created_at, updated_at)
        VALUES ('svc', 0, 0, 0)
        "#,
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}
