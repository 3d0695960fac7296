//! The Broker: in-memory ordered queues plus ephemeral keys for leader
//! lease, worker heartbeats, and atomic moves.
//!
//! Grounded in the reference implementation's `core/redis_client.py` /
//! `core/queue_manager.py` (the dual high/low Redis instance split and
//! the server-side Lua renewal script) and in the pack's `dimfeld-ergo`
//! example for idiomatic `redis`/`deadpool-redis` usage in Rust.

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

/// Two logical broker instances exist at runtime (`high`, `low`); this
/// trait describes the operations a single instance supports. Callers
/// hold one `Broker` per priority tier, never one namespaced by priority
/// (spec.md §4.2).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, queue: &str, message: &str) -> Result<()>;

    /// Appends every message to `queue` in a single pipelined round trip.
    /// The scheduler batches its per-tick enqueues through this rather
    /// than one `enqueue` call per row, per spec.md §4.4 step 2. A no-op
    /// on an empty slice.
    async fn enqueue_many(&self, queue: &str, messages: &[String]) -> Result<()>;

    /// Atomically pops the head of `queue` and pushes it onto
    /// `processing_queue`, blocking up to `timeout`. Returns `None` on
    /// timeout with nothing available. This is the only supported claim
    /// primitive — a pop followed by a separate push would lose the
    /// message on a crash in between.
    async fn blocking_pop_and_move(
        &self,
        queue: &str,
        processing_queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Removes the first occurrence of the exact message bytes from
    /// `queue`. Used to acknowledge completion by clearing the
    /// processing queue; a no-op (not an error) if the message isn't
    /// present.
    async fn remove_one(&self, queue: &str, message: &str) -> Result<()>;

    /// Read-only scan of `queue` for inspection by the reclaimer.
    async fn range(&self, queue: &str, start: isize, end: isize) -> Result<Vec<String>>;

    /// Atomic SETNX-with-expiry. Returns `true` if the key was absent and
    /// is now set (i.e. the caller acquired the lease).
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_ms: i64,
    ) -> Result<bool>;

    /// Atomic "extend expiration iff current value matches expected",
    /// implemented as a server-side script to avoid the TOCTOU race a
    /// GET-then-PEXPIRE pair would have.
    async fn compare_and_extend(&self, key: &str, expected_value: &str, ttl_ms: i64)
        -> Result<bool>;

    /// Atomic "delete iff current value matches expected" — used for
    /// graceful leader shutdown so a coordinator never deletes a lease
    /// another instance has since acquired.
    async fn compare_and_delete(&self, key: &str, expected_value: &str) -> Result<bool>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_s: i64) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// The atomic renewal script: returns 1 if the caller still owns the
/// lease (and its expiry was extended), 0 otherwise. Lifted verbatim
/// from the reference implementation's `RENEW_SCRIPT`.
const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Same shape, for compare-and-delete.
const DELETE_IF_MATCH_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub struct RedisBroker {
    pool: Pool,
}

impl RedisBroker {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let url = format!("redis://{host}:{port}");
        let cfg = PoolConfig::from_url(url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .context("failed to build redis connection pool")?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .context("failed to acquire redis connection from pool")
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, queue: &str, message: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .lpush(queue, message)
            .await
            .context("failed to enqueue message")?;
        Ok(())
    }

    async fn enqueue_many(&self, queue: &str, messages: &[String]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for message in messages {
            pipe.lpush(queue, message).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .context("failed to pipeline enqueue batch")?;
        Ok(())
    }

    async fn blocking_pop_and_move(
        &self,
        queue: &str,
        processing_queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let timeout_secs = timeout.as_secs_f64().max(0.0);

        let result: Option<String> = redis::cmd("BLMOVE")
            .arg(queue)
            .arg(processing_queue)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await
            .context("blmove failed")?;

        Ok(result)
    }

    async fn remove_one(&self, queue: &str, message: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .lrem(queue, 1, message)
            .await
            .context("failed to remove message from queue")?;
        debug!(queue, removed, "remove_one");
        Ok(())
    }

    async fn range(&self, queue: &str, start: isize, end: isize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.lrange(queue, start, end)
            .await
            .context("failed to range queue")
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_ms: i64,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .context("set_if_absent_with_expiry failed")?;
        Ok(result.is_some())
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected_value: &str,
        ttl_ms: i64,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(RENEW_SCRIPT);
        let result: i64 = script
            .key(key)
            .arg(expected_value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .context("compare_and_extend script failed")?;
        if result == 0 {
            warn!(key, "lease renewal lost: value mismatch or key absent");
        }
        Ok(result != 0)
    }

    async fn compare_and_delete(&self, key: &str, expected_value: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(DELETE_IF_MATCH_SCRIPT);
        let result: i64 = script
            .key(key)
            .arg(expected_value)
            .invoke_async(&mut conn)
            .await
            .context("compare_and_delete script failed")?;
        Ok(result != 0)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_s: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(key, value, ttl_s as u64)
            .await
            .context("set_with_expiry failed")?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists(key).await.context("exists check failed")
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.del(key).await.context("delete failed")?;
        Ok(())
    }
}

/// The two broker instances a coordinator/worker process holds, named
/// after their priority tier rather than any physical distinction.
pub struct BrokerPair {
    pub high: RedisBroker,
    pub low: RedisBroker,
}

impl BrokerPair {
    pub fn connect(
        host_high: &str,
        port_high: u16,
        host_low: &str,
        port_low: u16,
    ) -> Result<Self> {
        Ok(Self {
            high: RedisBroker::new(host_high, port_high)?,
            low: RedisBroker::new(host_low, port_low)?,
        })
    }
}

pub const DEFAULT_QUEUE: &str = "queue:default";
pub const DEFAULT_PROCESSING_QUEUE: &str = "processing:default";
pub const LEADER_KEY: &str = "taskflow:leader";

pub fn heartbeat_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:heartbeat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_key_has_expected_shape() {
        assert_eq!(heartbeat_key("abc123"), "worker:abc123:heartbeat");
    }

    #[test]
    fn well_known_names_match_spec() {
        assert_eq!(DEFAULT_QUEUE, "queue:default");
        assert_eq!(DEFAULT_PROCESSING_QUEUE, "processing:default");
        assert_eq!(LEADER_KEY, "taskflow:leader");
    }
}
