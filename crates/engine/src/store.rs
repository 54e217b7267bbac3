//! Durable store contract.
//!
//! One trait covering workflows, runs, step executions, and idempotency
//! keys, implemented by the Postgres repository in the `db` crate and by
//! [`crate::memory::MemoryStore`] for tests and local development.
//!
//! Run state transitions are conditional writes: `mark_run_running` only
//! moves pending → running, `complete_run` / `fail_run` only act on a
//! running run, and `cancel_run` only on pending/running. A stale worker
//! can therefore never resurrect a terminal run.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Run, RunError, Step, StepExecution, TriggerData, Workflow};
use crate::retry::RetryPolicy;
use handlers::{RunContext, StepError, StepType};

/// How long an idempotency key binds a trigger submission to its run.
pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Authoring input for a workflow and its steps.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub slug: String,
    pub webhook_secret: Option<String>,
    pub enabled: bool,
    pub steps: Vec<NewStep>,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub name: String,
    pub step_type: StepType,
    pub config: Value,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout_ms: Option<u64>,
    pub enabled: bool,
}

/// Input for a fresh step execution row (created in `pending` status).
#[derive(Debug, Clone)]
pub struct NewStepExecution {
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub attempt: u32,
    pub input: Value,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    // ------ workflows ------

    /// Insert a workflow with its steps; step orders are assigned `0..n` in
    /// input order.
    async fn create_workflow(&self, new: NewWorkflow) -> Result<Workflow, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    /// Fetch a workflow with its steps ordered by `order`.
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;

    async fn find_workflow_by_slug(&self, slug: &str) -> Result<Option<Workflow>, StoreError>;

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError>;

    /// Append a step at the end of the workflow's order sequence.
    async fn create_step(&self, workflow_id: Uuid, new: NewStep) -> Result<Step, StoreError>;

    /// Delete a step and re-densify the surviving orders to `[0..n)`.
    async fn delete_step(&self, workflow_id: Uuid, step_id: Uuid) -> Result<(), StoreError>;

    // ------ runs ------

    /// Create a pending run whose context is seeded from the trigger.
    async fn create_run(&self, workflow_id: Uuid, trigger: TriggerData)
        -> Result<Run, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError>;

    async fn list_runs(&self, workflow_id: Uuid) -> Result<Vec<Run>, StoreError>;

    /// pending → running; any other current status is left untouched.
    async fn mark_run_running(&self, id: Uuid) -> Result<(), StoreError>;

    /// Persist step progress: the advanced index and the grown context.
    async fn advance_run(
        &self,
        id: Uuid,
        current_step_index: u32,
        context: &RunContext,
    ) -> Result<(), StoreError>;

    /// running → completed (sets `completed_at`).
    async fn complete_run(&self, id: Uuid) -> Result<(), StoreError>;

    /// running → failed (sets `completed_at` and `error`).
    async fn fail_run(&self, id: Uuid, error: &RunError) -> Result<(), StoreError>;

    /// pending/running → cancelled. Returns whether a transition happened.
    async fn cancel_run(&self, id: Uuid) -> Result<bool, StoreError>;

    // ------ step executions ------

    async fn create_step_execution(
        &self,
        new: NewStepExecution,
    ) -> Result<StepExecution, StoreError>;

    async fn mark_step_execution_running(&self, id: Uuid) -> Result<(), StoreError>;

    async fn complete_step_execution(
        &self,
        id: Uuid,
        output: &Value,
        duration_ms: u64,
    ) -> Result<(), StoreError>;

    async fn fail_step_execution(
        &self,
        id: Uuid,
        error: &StepError,
        duration_ms: u64,
    ) -> Result<(), StoreError>;

    /// All executions for a run, ordered by start time.
    async fn list_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>, StoreError>;

    // ------ idempotency keys ------

    /// The bound run, iff the key exists and has not expired.
    async fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<Uuid>, StoreError>;

    /// Bind a key to a run with the 24-hour TTL; insert-if-absent.
    async fn bind_idempotency_key(&self, key: &str, run_id: Uuid) -> Result<(), StoreError>;

    /// Drop expired keys; returns how many were removed.
    async fn delete_expired_idempotency_keys(&self) -> Result<u64, StoreError>;
}
