//! Enrichment audit operator CLI (enrich-audit)
//!
//! Database setup, service configuration sync, scheduling queries, audit
//! statistics and privileged queue recovery. Workers link the library
//! directly; this binary never launches queued jobs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use enrich_audit::admin_log::AdminActionLog;
use enrich_audit::queue::{
    JobLauncher, LaunchOutcome, QueueJob, QueueSettings, RedisQueueStore, SequentialQueue,
};
use enrich_audit::{AuditLogStore, EntityRegistry, RefreshScheduler, ServiceRegistry};
use enrich_common::config::{load_config, resolve_config_path, EnrichConfig};
use enrich_common::db::init_database;
use enrich_common::{Clock, EntityKind, EntityRef, SystemClock};

/// Command-line arguments for enrich-audit
#[derive(Parser, Debug)]
#[command(name = "enrich-audit")]
#[command(about = "Operator tool for enrichment audit logs and the sequential queue")]
#[command(version)]
struct Args {
    /// Config file (falls back to ENRICH_CONFIG, then ./enrich.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and schema if missing
    InitDb,
    /// Upsert the [[services]] entries from the config file
    SyncServices,
    /// List which of the given entities are due for a service
    NeedingService {
        #[arg(long)]
        service: String,
        /// company, domain or person
        #[arg(long)]
        kind: String,
        /// Comma-separated entity ids; omit to scan the entity table
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
    },
    /// Audit statistics for a service
    Stats {
        #[arg(long)]
        service: String,
    },
    /// Show the sequential queue state
    QueueStatus,
    /// Release the processing lock regardless of holder
    ForceRelease {
        #[arg(long)]
        operator: String,
    },
    /// Drop all queued jobs and release the lock
    ClearQueue {
        #[arg(long)]
        operator: String,
    },
    /// Delete audit logs older than the retention window
    Cleanup {
        #[arg(long, default_value_t = enrich_audit::audit_log::DEFAULT_RETENTION_DAYS)]
        days: i64,
    },
    /// Recent privileged queue actions
    AdminActions {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

/// Launcher for operator commands, which never start jobs
struct OperatorLauncher;

#[async_trait::async_trait]
impl JobLauncher for OperatorLauncher {
    async fn launch(&self, job: &QueueJob) -> enrich_common::Result<LaunchOutcome> {
        Err(enrich_common::Error::External(format!(
            "operator CLI does not launch jobs (job {})",
            job.job_id
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref());
    let config = load_config(config_path.as_deref()).context("Failed to load configuration")?;

    // RUST_LOG overrides the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Using database {}", config.database_path.display());
    let pool = init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match args.command {
        Command::InitDb => {
            info!("Database ready");
        }
        Command::SyncServices => {
            let registry = ServiceRegistry::new(pool.clone(), clock.clone());
            let count = registry.sync_service_seeds(&config.services).await?;
            print_json(&serde_json::json!({ "synced": count }))?;
        }
        Command::NeedingService { service, kind, ids } => {
            let kind: EntityKind = kind.parse()?;
            let services = ServiceRegistry::new(pool.clone(), clock.clone());
            let scheduler = RefreshScheduler::new(pool.clone(), services, clock.clone());

            if ids.is_empty() {
                let registry = EntityRegistry::sqlite(&pool);
                let batch = scheduler.due_batch(&service, kind, &registry).await?;
                print_json(&batch)?;
            } else {
                let candidates: Vec<EntityRef> =
                    ids.into_iter().map(|id| EntityRef::new(kind, id)).collect();
                let due = scheduler.needing_service(&service, &candidates).await?;
                print_json(&due)?;
            }
        }
        Command::Stats { service } => {
            let store = audit_store(&config, pool.clone(), clock.clone());
            print_json(&store.service_stats(&service).await?)?;
        }
        Command::QueueStatus => {
            let queue = connect_queue(&config, pool.clone(), clock.clone()).await?;
            print_json(&queue.queue_status().await?)?;
        }
        Command::ForceRelease { operator } => {
            let queue = connect_queue(&config, pool.clone(), clock.clone()).await?;
            let had_lock = queue.force_release_lock(&operator).await?;
            print_json(&serde_json::json!({ "released": had_lock }))?;
        }
        Command::ClearQueue { operator } => {
            let queue = connect_queue(&config, pool.clone(), clock.clone()).await?;
            let removed = queue.clear_queue(&operator).await?;
            print_json(&serde_json::json!({ "jobs_removed": removed }))?;
        }
        Command::Cleanup { days } => {
            let store = audit_store(&config, pool.clone(), clock.clone());
            let removed = store.cleanup_old_logs(days).await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Command::AdminActions { limit } => {
            let log = AdminActionLog::new(pool.clone(), clock.clone());
            print_json(&log.recent(limit).await?)?;
        }
    }

    pool.close().await;
    Ok(())
}

fn audit_store(config: &EnrichConfig, pool: sqlx::SqlitePool, clock: Arc<dyn Clock>) -> AuditLogStore {
    AuditLogStore::new(pool, clock).with_max_lock_wait(config.database_max_lock_wait_ms)
}

async fn connect_queue(
    config: &EnrichConfig,
    pool: sqlx::SqlitePool,
    clock: Arc<dyn Clock>,
) -> Result<SequentialQueue> {
    let Some(redis_url) = config.redis_url.as_deref() else {
        bail!("redis_url is not configured; queue commands need shared storage");
    };
    let store = RedisQueueStore::connect(redis_url, &config.queue.namespace)
        .await
        .context("Failed to connect to Redis")?;

    Ok(SequentialQueue::new(
        config.queue.namespace.clone(),
        Arc::new(store),
        Arc::new(OperatorLauncher),
        AdminActionLog::new(pool, clock.clone()),
        clock,
        QueueSettings::from(&config.queue),
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
