//! Redis-backed queue store
//!
//! Keys under the configured namespace:
//! - `<ns>:queue` list of JSON jobs (RPUSH tail, LPOP head)
//! - `<ns>:lock` JSON [`LockInfo`], written with `SET NX PX`
//! - `<ns>:current_job` JSON [`CurrentJob`], written with `SET PX`
//!
//! Lock release runs a Lua compare-and-delete over the lock and the
//! current-job record, so a holder whose lock has expired and been re-taken
//! cannot delete the new holder's lock or job.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use enrich_common::{Error, Result};

use super::store::{CurrentJob, LockInfo, QueueStore};
use super::QueueJob;

const RELEASE_LOCK_SCRIPT: &str = r#"
local function held_by(key, token)
  local value = redis.call("GET", key)
  if not value then
    return false
  end
  local ok, decoded = pcall(cjson.decode, value)
  return ok and type(decoded) == "table" and decoded["holder_token"] == token
end
if held_by(KEYS[2], ARGV[1]) then
  redis.call("DEL", KEYS[2])
end
if held_by(KEYS[1], ARGV[1]) then
  redis.call("DEL", KEYS[1])
  return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisQueueStore {
    conn: MultiplexedConnection,
    queue_key: String,
    lock_key: String,
    current_job_key: String,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("queue_key", &self.queue_key)
            .field("lock_key", &self.lock_key)
            .finish()
    }
}

fn store_err(err: redis::RedisError) -> Error {
    Error::Queue(format!("Redis error: {}", err))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisQueueStore {
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(store_err)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(store_err)?;
        Ok(Self {
            conn,
            queue_key: format!("{}:queue", namespace),
            lock_key: format!("{}:lock", namespace),
            current_job_key: format!("{}:current_job", namespace),
        })
    }

    async fn raw_contents(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(&self.queue_key, 0, -1).await.map_err(store_err)
    }
}

#[async_trait::async_trait]
impl QueueStore for RedisQueueStore {
    async fn push_back(&self, job: &QueueJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(&self.queue_key, payload).await.map_err(store_err)?;
        Ok(())
    }

    async fn push_front(&self, job: &QueueJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(&self.queue_key, payload).await.map_err(store_err)?;
        Ok(())
    }

    async fn pop_front(&self) -> Result<Option<QueueJob>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.lpop(&self.queue_key, None).await.map_err(store_err)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.llen(&self.queue_key).await.map_err(store_err)
    }

    async fn contents(&self) -> Result<Vec<QueueJob>> {
        let raw = self.raw_contents().await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str::<QueueJob>(entry) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable queue entry");
                    None
                }
            })
            .collect())
    }

    async fn remove(&self, job_id: Uuid) -> Result<bool> {
        let raw = self.raw_contents().await?;
        let entry = raw.into_iter().find(|entry| {
            serde_json::from_str::<QueueJob>(entry)
                .map(|job| job.job_id == job_id)
                .unwrap_or(false)
        });
        let Some(entry) = entry else {
            return Ok(false);
        };

        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(&self.queue_key, 1, entry).await.map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let (len, _): (usize, i64) = redis::pipe()
            .atomic()
            .llen(&self.queue_key)
            .del(&self.queue_key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(len)
    }

    async fn try_acquire_lock(&self, lock: &LockInfo, ttl: Duration) -> Result<bool> {
        let value = serde_json::to_string(lock)?;
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.lock_key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&self.lock_key).await.map_err(store_err)?;
        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(lock) => Some(lock),
            Err(e) => {
                // Held, but its age is unknown
                warn!(error = %e, "Unparseable lock value");
                Some(LockInfo {
                    holder_token: raw,
                    acquired_at: None,
                })
            }
        }))
    }

    async fn release_lock(&self, holder_token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::cmd("EVAL")
            .arg(RELEASE_LOCK_SCRIPT)
            .arg(2)
            .arg(&self.lock_key)
            .arg(&self.current_job_key)
            .arg(holder_token)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(released == 1)
    }

    async fn force_release_lock(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (lock_deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(&self.lock_key)
            .del(&self.current_job_key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(lock_deleted > 0)
    }

    async fn set_current_job(&self, current: &CurrentJob, ttl: Duration) -> Result<()> {
        let value = serde_json::to_string(current)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(&self.current_job_key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn current_job(&self) -> Result<Option<CurrentJob>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&self.current_job_key).await.map_err(store_err)?;
        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(current) => Some(current),
            Err(e) => {
                warn!(error = %e, "Unparseable current job record");
                None
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_saturates_and_floors() {
        assert_eq!(ttl_millis(Duration::from_secs(30 * 60)), 1_800_000);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }
}
