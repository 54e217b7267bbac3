//! Queue abstraction — two named FIFO queues with delayed delivery.
//!
//! The broker delivers each message at most once per enqueue (`attempts = 1`
//! at its layer); the engine owns retries end-to-end via the `attempt`
//! counter carried inside `ExecuteStep`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::RunStatus;
use handlers::StepType;

/// Observability retention: completed / failed message records kept.
pub const COMPLETED_RETENTION: usize = 1_000;
pub const FAILED_RETENTION: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Execute,
    Ai,
}

impl QueueName {
    /// AI steps go to the narrower `ai` queue; everything else to `execute`.
    pub fn for_step(step_type: StepType) -> Self {
        match step_type {
            StepType::Ai => Self::Ai,
            _ => Self::Execute,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Ai => "ai",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages flowing through the queues. Every `ExecuteStep` is
/// self-describing: `(step_index, step_id, attempt)` let the processor
/// reject duplicates and stale deliveries without relying on queue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobMessage {
    StartRun {
        run_id: Uuid,
        workflow_id: Uuid,
    },
    ExecuteStep {
        run_id: Uuid,
        workflow_id: Uuid,
        step_index: u32,
        step_id: Uuid,
        attempt: u32,
    },
    /// Reserved; the processor updates run state directly.
    CompleteRun {
        run_id: Uuid,
        status: RunStatus,
    },
}

impl JobMessage {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::StartRun { run_id, .. }
            | Self::ExecuteStep { run_id, .. }
            | Self::CompleteRun { run_id, .. } => *run_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("queue serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Broker contract.
///
/// `enqueue` returns after durable acceptance and delivers no earlier than
/// `now + delay`, preserving per-producer FIFO order for `delay = 0`.
/// `dequeue` blocks until a message is ready.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(
        &self,
        queue: QueueName,
        message: JobMessage,
        delay: Duration,
    ) -> Result<(), QueueError>;

    async fn dequeue(&self, queue: QueueName) -> Result<JobMessage, QueueError>;

    /// Move due delayed messages onto the ready queue. Backends with native
    /// delayed delivery may leave this as the no-op default.
    async fn pump_delayed(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    /// Record a processed message for observability. Retention is bounded
    /// (last 1,000 completed / 5,000 failed); not required for correctness.
    async fn record_outcome(
        &self,
        queue: QueueName,
        message: &JobMessage,
        success: bool,
    ) -> Result<(), QueueError>;
}
