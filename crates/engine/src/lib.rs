//! `engine` crate — core domain models, the run processor, and the
//! queue/lock/store abstractions it is built on.
//!
//! The processor is the only writer of a run's mutable state; everything it
//! touches is an explicit dependency (store, queue, lock manager, handler
//! registry) so the whole state machine runs unchanged against Postgres +
//! Redis in production and the in-memory backends in tests.

pub mod config;
pub mod error;
pub mod lock;
pub mod models;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod store;
pub mod worker;

pub use config::{EngineConfig, Limits};
pub use error::EngineError;
pub use lock::{run_lock_key, LockError, LockManager};
pub use models::{
    Run, RunError, RunStatus, Step, StepExecution, StepExecutionStatus, TriggerData, Workflow,
};
pub use processor::RunProcessor;
pub use queue::{JobMessage, Queue, QueueError, QueueName};
pub use retry::{calculate_backoff, BackoffType, RetryPolicy};
pub use storage::{MemoryLockManager, MemoryQueue, MemoryStore, RedisLockManager, RedisQueue};
pub use store::{NewStep, NewStepExecution, NewWorkflow, RunStore, StoreError};
pub use worker::{WorkerConfig, WorkerPool};

// Shared with the handlers crate; re-exported so downstream crates have a
// single import root for domain types.
pub use handlers::{ErrorCategory, RunContext, StepError, StepType};

#[cfg(test)]
mod processor_tests;
