//! Test Helper Utilities
//!
//! In-memory database, manual clock and the audit components wired together.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::sync::Arc;

use enrich_audit::{
    AuditExecutor, AuditLogStore, EntityRegistry, RefreshScheduler, ServiceConfiguration,
    ServiceRegistry,
};
use enrich_common::db::init::init_memory_database;
use enrich_common::{Clock, EntityKind, ManualClock};

pub struct TestEnv {
    pub pool: SqlitePool,
    pub clock: ManualClock,
    pub store: AuditLogStore,
    pub services: ServiceRegistry,
    pub scheduler: RefreshScheduler,
    pub executor: AuditExecutor,
}

impl TestEnv {
    pub fn clock_arc(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Insert an active configuration for `service_name`
    pub async fn configure(&self, service_name: &str, refresh_interval_hours: i64) -> ServiceConfiguration {
        let mut config = ServiceConfiguration::default_for(service_name);
        config.refresh_interval_hours = refresh_interval_hours;
        self.services.upsert(&config).await.unwrap()
    }

    pub fn registry(&self) -> EntityRegistry {
        EntityRegistry::sqlite(&self.pool)
    }
}

/// Fresh in-memory database with host entity tables and a clock fixed at
/// 2026-03-02 09:00 UTC
pub async fn test_env() -> TestEnv {
    let pool = init_memory_database().await.unwrap();
    create_entity_tables(&pool).await;

    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());

    let store = AuditLogStore::new(pool.clone(), clock_arc.clone());
    let services = ServiceRegistry::new(pool.clone(), clock_arc.clone());
    let scheduler = RefreshScheduler::new(pool.clone(), services.clone(), clock_arc);
    let executor = AuditExecutor::new(store.clone());

    TestEnv {
        pool,
        clock,
        store,
        services,
        scheduler,
        executor,
    }
}

pub async fn create_entity_tables(pool: &SqlitePool) {
    for kind in EntityKind::ALL {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, name TEXT)",
            kind.table_name()
        ))
        .execute(pool)
        .await
        .unwrap();
    }
}

pub async fn insert_entities(pool: &SqlitePool, kind: EntityKind, ids: &[i64]) {
    for id in ids {
        sqlx::query(&format!(
            "INSERT INTO {} (id, name) VALUES (?, ?)",
            kind.table_name()
        ))
        .bind(id)
        .bind(format!("{} {}", kind, id))
        .execute(pool)
        .await
        .unwrap();
    }
}

pub fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected JSON object, got {}", other),
    }
}
