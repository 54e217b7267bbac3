//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour beyond
//! the conversions into the `engine` crate's domain types.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use engine::{Run, RunError, RunStatus, Step, StepExecution, StepExecutionStatus, TriggerData};
use handlers::{RunContext, StepError, StepType};

use crate::DbError;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub webhook_secret: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    /// Assemble the domain workflow from this row and its step rows.
    pub fn into_workflow(self, steps: Vec<StepRow>) -> Result<engine::Workflow, DbError> {
        let steps = steps
            .into_iter()
            .map(StepRow::into_step)
            .collect::<Result<Vec<Step>, DbError>>()?;
        Ok(engine::Workflow {
            id: self.id,
            name: self.name,
            slug: self.slug,
            webhook_secret: self.webhook_secret,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
            steps,
        })
    }
}

// ---------------------------------------------------------------------------
// steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct StepRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub order: i32,
    pub name: String,
    #[sqlx(rename = "type")]
    pub step_type: String,
    pub config: Value,
    pub retry_policy: Option<Value>,
    pub timeout_ms: Option<i64>,
    pub enabled: bool,
}

impl StepRow {
    pub fn into_step(self) -> Result<Step, DbError> {
        let step_type: StepType = self
            .step_type
            .parse()
            .map_err(|e: String| DbError::Decode(e))?;
        let retry_policy = self
            .retry_policy
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| DbError::Decode(format!("retry_policy: {e}")))?;
        Ok(Step {
            id: self.id,
            workflow_id: self.workflow_id,
            order: self.order,
            name: self.name,
            step_type,
            config: self.config,
            retry_policy,
            timeout_ms: self.timeout_ms.map(|ms| ms as u64),
            enabled: self.enabled,
        })
    }
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    pub trigger_data: Value,
    pub context: Value,
    pub current_step_index: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<Value>,
}

impl RunRow {
    pub fn into_run(self) -> Result<Run, DbError> {
        let status: RunStatus = self.status.parse().map_err(|e: String| DbError::Decode(e))?;
        let trigger_data: TriggerData = serde_json::from_value(self.trigger_data)
            .map_err(|e| DbError::Decode(format!("trigger_data: {e}")))?;
        let context: RunContext = serde_json::from_value(self.context)
            .map_err(|e| DbError::Decode(format!("context: {e}")))?;
        let error: Option<RunError> = self
            .error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| DbError::Decode(format!("error: {e}")))?;
        Ok(Run {
            id: self.id,
            workflow_id: self.workflow_id,
            status,
            trigger_data,
            context,
            current_step_index: self.current_step_index as u32,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error,
        })
    }
}

// ---------------------------------------------------------------------------
// step_executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct StepExecutionRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub status: String,
    pub attempt: i32,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl StepExecutionRow {
    pub fn into_step_execution(self) -> Result<StepExecution, DbError> {
        let status: StepExecutionStatus =
            self.status.parse().map_err(|e: String| DbError::Decode(e))?;
        let error: Option<StepError> = self
            .error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| DbError::Decode(format!("error: {e}")))?;
        Ok(StepExecution {
            id: self.id,
            run_id: self.run_id,
            step_id: self.step_id,
            step_name: self.step_name,
            status,
            attempt: self.attempt as u32,
            input: self.input,
            output: self.output,
            error,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms.map(|ms| ms as u64),
        })
    }
}

// ---------------------------------------------------------------------------
// idempotency_keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyKeyRow {
    pub key: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
