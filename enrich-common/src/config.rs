//! Bootstrap configuration
//!
//! Loaded once from a TOML file. Resolution order for the file path:
//! 1. Command-line argument (highest priority)
//! 2. `ENRICH_CONFIG` environment variable
//! 3. `./enrich.toml` in the working directory
//! 4. Built-in defaults (no file)
//!
//! A missing file is not fatal: a warning is logged and defaults apply.
//! A file that exists but does not parse is a configuration error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "ENRICH_CONFIG";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "enrich.toml";

/// Top-level bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// SQLite database holding audit logs and service configurations
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Upper bound on retrying writes that hit "database is locked"
    #[serde(default = "default_max_lock_wait_ms")]
    pub database_max_lock_wait_ms: u64,

    /// Shared fast storage for the sequential queue (required for queue commands)
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auditing: AuditingConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    /// Service configurations synced into the registry table at startup
    #[serde(default)]
    pub services: Vec<ServiceSeed>,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            database_max_lock_wait_ms: default_max_lock_wait_ms(),
            redis_url: None,
            logging: LoggingConfig::default(),
            auditing: AuditingConfig::default(),
            queue: QueueConfig::default(),
            services: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Lifecycle auditing switch, passed explicitly to the audit layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditingConfig {
    #[serde(default = "default_true")]
    pub lifecycle_enabled: bool,
}

impl Default for AuditingConfig {
    fn default() -> Self {
        Self {
            lifecycle_enabled: true,
        }
    }
}

/// Sequential external-call queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Key prefix in shared storage
    #[serde(default = "default_queue_namespace")]
    pub namespace: String,

    /// Lock expiry; a crashed holder's lock disappears after this long
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Lock age at which the holder is considered stuck
    #[serde(default = "default_max_job_duration_secs")]
    pub max_job_duration_secs: u64,

    /// How often the watchdog checks for stuck locks
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: default_queue_namespace(),
            lock_ttl_secs: default_lock_ttl_secs(),
            max_job_duration_secs: default_max_job_duration_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
        }
    }
}

/// Service configuration entry as written by operators in TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSeed {
    pub service_name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_refresh_interval_hours")]
    pub refresh_interval_hours: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: i64,
    #[serde(default)]
    pub depends_on_services: Vec<String>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("enrich.db")
}

fn default_max_lock_wait_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_queue_namespace() -> String {
    "phantombuster".to_string()
}

fn default_lock_ttl_secs() -> u64 {
    30 * 60
}

fn default_max_job_duration_secs() -> u64 {
    30 * 60
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

/// Refresh interval for services created without explicit policy (30 days)
pub fn default_refresh_interval_hours() -> i64 {
    720
}

pub fn default_batch_size() -> i64 {
    1000
}

pub fn default_retry_attempts() -> i64 {
    3
}

/// Pick the config file path by priority order
///
/// Returns `None` when no candidate exists, meaning built-in defaults apply.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Working directory
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }

    None
}

/// Parse configuration from TOML text
pub fn parse_config(content: &str) -> Result<EnrichConfig> {
    let config: EnrichConfig = toml::from_str(content)
        .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from `path`, falling back to defaults if it is missing
pub fn load_config(path: Option<&Path>) -> Result<EnrichConfig> {
    let Some(path) = path else {
        info!("No config file given, using built-in defaults");
        return Ok(EnrichConfig::default());
    };

    if !path.exists() {
        warn!("Config file not found: {}, using built-in defaults", path.display());
        return Ok(EnrichConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    info!(
        "Loaded config from {} ({} service seeds)",
        path.display(),
        config.services.len()
    );
    Ok(config)
}

/// Serialize configuration back to TOML (used to write a starter file)
pub fn write_config(config: &EnrichConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // Write to a sibling temp file, then rename over the target
    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn validate_config(config: &EnrichConfig) -> Result<()> {
    if config.queue.namespace.trim().is_empty() {
        return Err(Error::Config("queue.namespace must not be empty".to_string()));
    }
    if config.queue.lock_ttl_secs == 0 {
        return Err(Error::Config("queue.lock_ttl_secs must be greater than 0".to_string()));
    }
    if config.queue.watchdog_interval_secs == 0 {
        return Err(Error::Config(
            "queue.watchdog_interval_secs must be greater than 0".to_string(),
        ));
    }
    Ok(())
}
