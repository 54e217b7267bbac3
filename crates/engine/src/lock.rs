//! Run lock — a TTL'd mutual-exclusion lease per run id.
//!
//! Acquisition is set-if-absent and returns an opaque token; release and
//! extension are compare-and-act on that token so a worker whose lease
//! expired (and was re-acquired by someone else) can never clobber the new
//! holder's lock.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub fn run_lock_key(run_id: Uuid) -> String {
    format!("lock:run:{run_id}")
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to acquire the lease. Returns the holder token, or `None` when
    /// another worker holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>, LockError>;

    /// Extend the lease if `token` still holds it.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release the lease if `token` still holds it.
    async fn release(&self, key: &str, token: &str) -> Result<(), LockError>;
}
