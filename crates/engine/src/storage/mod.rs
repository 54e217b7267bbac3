//! Queue and lock backends.
//!
//! `redis` is the production pair (deadpool-backed queue + lease manager);
//! `memory` runs the same contracts in-process for tests and local
//! development. The Postgres [`crate::store::RunStore`] implementation
//! lives in the `db` crate.

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryLockManager, MemoryQueue, MemoryStore};
pub use self::redis::{create_pool, RedisLockManager, RedisQueue};
