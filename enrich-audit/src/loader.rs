//! Entity loaders
//!
//! The audit layer never owns entity tables. It reaches them through a
//! [`EntityLoader`] per [`EntityKind`], registered in an [`EntityRegistry`]
//! by the host application. The registry is a fixed map from kind to
//! loader; there is no lookup by arbitrary type name.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use enrich_common::{EntityKind, EntityRef, Error, Result};

/// Read access to one kind of entity
#[async_trait::async_trait]
pub trait EntityLoader: Send + Sync {
    /// Kind this loader serves
    fn kind(&self) -> EntityKind;

    /// Whether an entity with `id` exists
    async fn exists(&self, id: i64) -> Result<bool>;

    /// Ids eligible for scheduling, ascending
    ///
    /// `limit` of `None` returns all ids.
    async fn candidate_ids(&self, limit: Option<i64>) -> Result<Vec<i64>>;
}

/// Loader lookup by entity kind
#[derive(Clone, Default)]
pub struct EntityRegistry {
    loaders: HashMap<EntityKind, Arc<dyn EntityLoader>>,
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.loaders.keys().collect();
        kinds.sort();
        f.debug_struct("EntityRegistry").field("kinds", &kinds).finish()
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a [`SqliteEntityLoader`] for every kind, using the
    /// conventional table names
    pub fn sqlite(pool: &SqlitePool) -> Self {
        let mut registry = Self::new();
        for kind in EntityKind::ALL {
            registry.register(Arc::new(SqliteEntityLoader::new(pool.clone(), kind)));
        }
        registry
    }

    /// Register (or replace) the loader for its kind
    pub fn register(&mut self, loader: Arc<dyn EntityLoader>) {
        self.loaders.insert(loader.kind(), loader);
    }

    pub fn get(&self, kind: EntityKind) -> Result<&Arc<dyn EntityLoader>> {
        self.loaders
            .get(&kind)
            .ok_or_else(|| Error::Config(format!("No entity loader registered for {}", kind)))
    }

    pub async fn exists(&self, entity: EntityRef) -> Result<bool> {
        self.get(entity.kind)?.exists(entity.id).await
    }

    /// Fail with `NotFound` unless `entity` exists
    pub async fn ensure_exists(&self, entity: EntityRef) -> Result<()> {
        if self.exists(entity).await? {
            Ok(())
        } else {
            Err(Error::NotFound(entity.to_string()))
        }
    }
}

/// Loader over a host table with an INTEGER `id` primary key
#[derive(Debug, Clone)]
pub struct SqliteEntityLoader {
    pool: SqlitePool,
    kind: EntityKind,
    table: String,
}

impl SqliteEntityLoader {
    pub fn new(pool: SqlitePool, kind: EntityKind) -> Self {
        Self {
            pool,
            kind,
            table: kind.table_name().to_string(),
        }
    }

    /// Loader over a custom table name
    ///
    /// The name is interpolated into SQL, so only plain identifiers are
    /// accepted.
    pub fn with_table(pool: SqlitePool, kind: EntityKind, table: &str) -> Result<Self> {
        if !is_identifier(table) {
            return Err(Error::Validation(format!("Invalid table name: {:?}", table)));
        }
        Ok(Self {
            pool,
            kind,
            table: table.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl EntityLoader for SqliteEntityLoader {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn exists(&self, id: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)",
            self.table
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn candidate_ids(&self, limit: Option<i64>) -> Result<Vec<i64>> {
        // LIMIT -1 is unbounded in SQLite
        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM {} ORDER BY id LIMIT ?",
            self.table
        ))
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
