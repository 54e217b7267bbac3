//! Redis-backed queue and lock manager.
//!
//! # Data structures
//!
//! - `hookflow:queue:{name}:ready` (LIST): FIFO of ready message envelopes
//! - `hookflow:queue:{name}:delayed` (ZSET): delayed envelopes, score =
//!   deliver-at epoch millis, moved onto the ready list by the pump
//! - `hookflow:queue:{name}:completed` / `:failed` (LIST): bounded
//!   observability records of processed messages
//! - `lock:run:{run_id}` (STRING): lease token with PX expiry
//!
//! Envelopes wrap each message with a fresh id so identical retry messages
//! stay distinct ZSET members.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lock::{LockError, LockManager};
use crate::queue::{
    JobMessage, Queue, QueueError, QueueName, COMPLETED_RETENTION, FAILED_RETENTION,
};

/// Poll interval for an empty ready list and for the delayed pump.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How many delayed envelopes one pump pass moves per queue.
const PUMP_BATCH: isize = 100;

#[derive(Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    message: JobMessage,
}

fn ready_key(queue: QueueName) -> String {
    format!("hookflow:queue:{queue}:ready")
}

fn delayed_key(queue: QueueName) -> String {
    format!("hookflow:queue:{queue}:delayed")
}

fn outcome_key(queue: QueueName, success: bool) -> String {
    let suffix = if success { "completed" } else { "failed" };
    format!("hookflow:queue:{queue}:{suffix}")
}

fn backend_err(e: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(e.to_string())
}

/// Connection pool shared by the queue and the lock manager.
pub fn create_pool(redis_url: &str) -> Result<Pool, QueueError> {
    Config::from_url(redis_url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(backend_err)
}

pub struct RedisQueue {
    pool: Pool,
}

impl RedisQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool.get().await.map_err(backend_err)
    }

    async fn pump_queue(&self, queue: QueueName) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(delayed_key(queue))
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PUMP_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;

        let mut moved = 0;
        for envelope in due {
            // ZREM returning 1 means this process won the member; only the
            // winner pushes, so a concurrent pump never duplicates delivery.
            let removed: i64 = conn
                .zrem(delayed_key(queue), &envelope)
                .await
                .map_err(backend_err)?;
            if removed == 1 {
                let _: () = conn
                    .rpush(ready_key(queue), &envelope)
                    .await
                    .map_err(backend_err)?;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        message: JobMessage,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let envelope = serde_json::to_string(&Envelope {
            id: Uuid::new_v4(),
            message,
        })?;
        let mut conn = self.connection().await?;

        if delay.is_zero() {
            let _: () = conn
                .rpush(ready_key(queue), envelope)
                .await
                .map_err(backend_err)?;
        } else {
            let deliver_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let _: () = conn
                .zadd(delayed_key(queue), envelope, deliver_at)
                .await
                .map_err(backend_err)?;
        }
        Ok(())
    }

    async fn dequeue(&self, queue: QueueName) -> Result<JobMessage, QueueError> {
        loop {
            let popped: Option<String> = {
                let mut conn = self.connection().await?;
                conn.lpop(ready_key(queue), None).await.map_err(backend_err)?
            };
            match popped {
                Some(raw) => {
                    let envelope: Envelope = serde_json::from_str(&raw)?;
                    return Ok(envelope.message);
                }
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }

    async fn pump_delayed(&self) -> Result<usize, QueueError> {
        let mut moved = 0;
        for queue in [QueueName::Execute, QueueName::Ai] {
            moved += self.pump_queue(queue).await?;
        }
        Ok(moved)
    }

    async fn record_outcome(
        &self,
        queue: QueueName,
        message: &JobMessage,
        success: bool,
    ) -> Result<(), QueueError> {
        let retention = if success {
            COMPLETED_RETENTION
        } else {
            FAILED_RETENTION
        };
        let key = outcome_key(queue, success);
        let record = serde_json::to_string(message)?;

        let mut conn = self.connection().await?;
        let _: () = conn.lpush(&key, record).await.map_err(backend_err)?;
        let _: () = conn
            .ltrim(&key, 0, retention as isize - 1)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lock manager
// ---------------------------------------------------------------------------

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

pub struct RedisLockManager {
    pool: Pool,
    extend_script: redis::Script,
    release_script: redis::Script,
}

impl RedisLockManager {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            extend_script: redis::Script::new(EXTEND_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, LockError> {
        self.pool
            .get()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>, LockError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.connection().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(acquired.map(|_| token))
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self.connection().await?;
        let _: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}
