//! Service configuration registry
//!
//! Per-service refresh policy, one row per `service_name`. The audit core
//! only reads it; the mutation methods exist for operators and for syncing
//! `[[services]]` seeds from the bootstrap TOML.
//!
//! A missing or inactive configuration means "service disabled". Readers
//! treat that as an empty answer, never as an error.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::info;

use enrich_common::config::{
    default_batch_size, default_refresh_interval_hours, default_retry_attempts, ServiceSeed,
};
use enrich_common::time::{from_millis, to_millis};
use enrich_common::{Clock, Error, Result};

use crate::audit_log::MAX_SERVICE_NAME_LEN;
use crate::lifecycle::AUTOMATIC_AUDIT_SERVICE;

/// Refresh policy for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub service_name: String,
    pub active: bool,
    pub refresh_interval_hours: i64,
    pub batch_size: i64,
    pub retry_attempts: i64,
    pub depends_on_services: Vec<String>,
    pub settings: Map<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ServiceConfiguration {
    /// Active configuration with the standard policy: 30 day refresh,
    /// batches of 1000, three retries
    pub fn default_for(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            active: true,
            refresh_interval_hours: default_refresh_interval_hours(),
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            depends_on_services: Vec::new(),
            settings: Map::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Window within which a successful run satisfies the refresh policy
    ///
    /// Saturates at `Duration::MAX` for intervals too large to represent.
    pub fn refresh_threshold(&self) -> Duration {
        Duration::try_hours(self.refresh_interval_hours).unwrap_or(Duration::MAX)
    }

    /// Latest completion time that no longer satisfies the policy at `now`
    ///
    /// `None` when the window reaches back past the representable range,
    /// in which case any recorded success still counts.
    pub fn refresh_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::try_hours(self.refresh_interval_hours).and_then(|t| now.checked_sub_signed(t))
    }

    /// Whether a service last run at `last_run` is due again at `now`
    pub fn needs_refresh(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (last_run, self.refresh_cutoff(now)) {
            (None, _) => true,
            (Some(at), Some(cutoff)) => at <= cutoff,
            (Some(_), None) => false,
        }
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.service_name.trim();
        if name.is_empty() {
            return Err(Error::Validation("service_name is required".to_string()));
        }
        if name.len() > MAX_SERVICE_NAME_LEN {
            return Err(Error::Validation(format!(
                "service_name exceeds {} characters",
                MAX_SERVICE_NAME_LEN
            )));
        }
        if name == AUTOMATIC_AUDIT_SERVICE {
            return Err(Error::Validation(format!(
                "{} is reserved for lifecycle auditing",
                AUTOMATIC_AUDIT_SERVICE
            )));
        }
        if self.refresh_interval_hours < 0 {
            return Err(Error::Validation(
                "refresh_interval_hours must not be negative".to_string(),
            ));
        }
        if self.batch_size <= 0 {
            return Err(Error::Validation("batch_size must be greater than 0".to_string()));
        }
        if self.retry_attempts < 0 {
            return Err(Error::Validation("retry_attempts must not be negative".to_string()));
        }
        if self.depends_on_services.iter().any(|d| d == name) {
            return Err(Error::Validation(format!("{} cannot depend on itself", name)));
        }
        Ok(())
    }
}

impl From<&ServiceSeed> for ServiceConfiguration {
    fn from(seed: &ServiceSeed) -> Self {
        Self {
            service_name: seed.service_name.clone(),
            active: seed.active,
            refresh_interval_hours: seed.refresh_interval_hours,
            batch_size: seed.batch_size,
            retry_attempts: seed.retry_attempts,
            depends_on_services: seed.depends_on_services.clone(),
            settings: seed.settings.clone(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// SQLite-backed registry of service configurations
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl ServiceRegistry {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn find(&self, service_name: &str) -> Result<Option<ServiceConfiguration>> {
        if service_name.trim().is_empty() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM service_configurations WHERE service_name = ?")
            .bind(service_name.trim())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_config).transpose()
    }

    /// False when absent or explicitly inactive
    pub async fn is_active(&self, service_name: &str) -> Result<bool> {
        Ok(self
            .find(service_name)
            .await?
            .map(|c| c.active)
            .unwrap_or(false))
    }

    /// Refresh window of an active service; `None` when disabled
    pub async fn refresh_threshold(&self, service_name: &str) -> Result<Option<Duration>> {
        Ok(self
            .find(service_name)
            .await?
            .filter(|c| c.active)
            .map(|c| c.refresh_threshold()))
    }

    pub async fn list_active(&self) -> Result<Vec<ServiceConfiguration>> {
        let rows = sqlx::query(
            "SELECT * FROM service_configurations WHERE active = 1 ORDER BY service_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_config).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<ServiceConfiguration>> {
        let rows = sqlx::query("SELECT * FROM service_configurations ORDER BY service_name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_config).collect()
    }

    /// Every dependency exists and is active
    ///
    /// An unknown service has no dependencies to satisfy.
    pub async fn dependencies_met(&self, service_name: &str) -> Result<bool> {
        let Some(config) = self.find(service_name).await? else {
            return Ok(true);
        };
        for dependency in &config.depends_on_services {
            if !self.is_active(dependency).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn setting(&self, service_name: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .find(service_name)
            .await?
            .and_then(|c| c.settings.get(key).cloned()))
    }

    /// Insert or replace a configuration
    pub async fn upsert(&self, config: &ServiceConfiguration) -> Result<ServiceConfiguration> {
        config.validate()?;
        let now = to_millis(self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO service_configurations (
                service_name, active, refresh_interval_hours, batch_size, retry_attempts,
                depends_on_services, settings, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(service_name) DO UPDATE SET
                active = excluded.active,
                refresh_interval_hours = excluded.refresh_interval_hours,
                batch_size = excluded.batch_size,
                retry_attempts = excluded.retry_attempts,
                depends_on_services = excluded.depends_on_services,
                settings = excluded.settings,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(config.service_name.trim())
        .bind(config.active)
        .bind(config.refresh_interval_hours)
        .bind(config.batch_size)
        .bind(config.retry_attempts)
        .bind(serde_json::to_string(&config.depends_on_services)?)
        .bind(serde_json::to_string(&config.settings)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(
            service = %config.service_name,
            active = config.active,
            refresh_interval_hours = config.refresh_interval_hours,
            "Service configuration saved"
        );

        self.require(config.service_name.trim()).await
    }

    pub async fn set_active(&self, service_name: &str, active: bool) -> Result<ServiceConfiguration> {
        let mut config = self.require(service_name).await?;
        config.active = active;
        self.upsert(&config).await
    }

    pub async fn add_dependency(&self, service_name: &str, dependency: &str) -> Result<ServiceConfiguration> {
        let mut config = self.require(service_name).await?;
        if config.depends_on_services.iter().any(|d| d == dependency) {
            return Ok(config);
        }
        config.depends_on_services.push(dependency.to_string());
        self.upsert(&config).await
    }

    pub async fn remove_dependency(&self, service_name: &str, dependency: &str) -> Result<ServiceConfiguration> {
        let mut config = self.require(service_name).await?;
        config.depends_on_services.retain(|d| d != dependency);
        self.upsert(&config).await
    }

    pub async fn update_setting(
        &self,
        service_name: &str,
        key: &str,
        value: Value,
    ) -> Result<ServiceConfiguration> {
        let mut config = self.require(service_name).await?;
        config.settings.insert(key.to_string(), value);
        self.upsert(&config).await
    }

    /// Upsert every seed from the bootstrap config; returns the count written
    ///
    /// Seeds are validated up front so a bad entry leaves the table untouched.
    pub async fn sync_service_seeds(&self, seeds: &[ServiceSeed]) -> Result<usize> {
        let configs: Vec<ServiceConfiguration> = seeds.iter().map(ServiceConfiguration::from).collect();
        for config in &configs {
            config.validate()?;
        }
        for config in &configs {
            self.upsert(config).await?;
        }
        info!("Synced {} service configuration seeds", configs.len());
        Ok(configs.len())
    }

    async fn require(&self, service_name: &str) -> Result<ServiceConfiguration> {
        self.find(service_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("service configuration {}", service_name)))
    }
}

fn row_to_config(row: &SqliteRow) -> Result<ServiceConfiguration> {
    let depends: String = row.get("depends_on_services");
    let settings: String = row.get("settings");
    Ok(ServiceConfiguration {
        service_name: row.get("service_name"),
        active: row.get("active"),
        refresh_interval_hours: row.get("refresh_interval_hours"),
        batch_size: row.get("batch_size"),
        retry_attempts: row.get("retry_attempts"),
        depends_on_services: serde_json::from_str(&depends)?,
        settings: serde_json::from_str(&settings)?,
        created_at: Some(from_millis(row.get("created_at"))),
        updated_at: Some(from_millis(row.get("updated_at"))),
    })
}
