//! `PgStore` — the Postgres implementation of the engine's store trait.
//!
//! A thin adapter: domain types in, repository functions down, domain types
//! out. Uniqueness violations surface as `StoreError::Conflict` so the
//! processor can distinguish duplicated attempts from infrastructure
//! failures.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use engine::store::{
    NewStep, NewStepExecution, NewWorkflow, RunStore, StoreError, IDEMPOTENCY_TTL_HOURS,
};
use engine::{Run, RunError, Step, StepExecution, TriggerData, Workflow};
use handlers::{RunContext, StepError};

use crate::repository::{executions, idempotency, runs, workflows};
use crate::repository::workflows::StepInsert;
use crate::{DbError, DbPool};

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => StoreError::NotFound,
            other if other.is_unique_violation() => StoreError::Conflict(other.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(format!("serialize {what}: {e}")))
}

fn step_insert(new: NewStep) -> Result<StepInsert, StoreError> {
    let retry_policy = new
        .retry_policy
        .as_ref()
        .map(|p| to_json(p, "retry policy"))
        .transpose()?;
    Ok(StepInsert {
        name: new.name,
        step_type: new.step_type.to_string(),
        config: new.config,
        retry_policy,
        timeout_ms: new.timeout_ms.map(|ms| ms as i64),
        enabled: new.enabled,
    })
}

#[async_trait]
impl RunStore for PgStore {
    async fn create_workflow(&self, new: NewWorkflow) -> Result<Workflow, StoreError> {
        let steps = new
            .steps
            .into_iter()
            .map(step_insert)
            .collect::<Result<Vec<_>, StoreError>>()?;
        let (workflow, step_rows) = workflows::create_workflow(
            &self.pool,
            &new.name,
            &new.slug,
            new.webhook_secret.as_deref(),
            new.enabled,
            steps,
        )
        .await?;
        Ok(workflow.into_workflow(step_rows)?)
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = workflows::list_workflows(&self.pool).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let steps = workflows::list_steps(&self.pool, row.id).await?;
            result.push(row.into_workflow(steps)?);
        }
        Ok(result)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let row = workflows::get_workflow(&self.pool, id).await?;
        let steps = workflows::list_steps(&self.pool, id).await?;
        Ok(row.into_workflow(steps)?)
    }

    async fn find_workflow_by_slug(&self, slug: &str) -> Result<Option<Workflow>, StoreError> {
        let Some(row) = workflows::find_workflow_by_slug(&self.pool, slug).await? else {
            return Ok(None);
        };
        let steps = workflows::list_steps(&self.pool, row.id).await?;
        Ok(Some(row.into_workflow(steps)?))
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(workflows::delete_workflow(&self.pool, id).await?)
    }

    async fn create_step(&self, workflow_id: Uuid, new: NewStep) -> Result<Step, StoreError> {
        let row = workflows::create_step(&self.pool, workflow_id, step_insert(new)?).await?;
        Ok(row.into_step()?)
    }

    async fn delete_step(&self, workflow_id: Uuid, step_id: Uuid) -> Result<(), StoreError> {
        Ok(workflows::delete_step(&self.pool, workflow_id, step_id).await?)
    }

    async fn create_run(
        &self,
        workflow_id: Uuid,
        trigger: TriggerData,
    ) -> Result<Run, StoreError> {
        let context = to_json(&trigger.initial_context(), "context")?;
        let trigger_data = to_json(&trigger, "trigger data")?;
        let row = runs::create_run(&self.pool, workflow_id, trigger_data, context).await?;
        Ok(row.into_run()?)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError> {
        Ok(runs::get_run(&self.pool, id).await?.into_run()?)
    }

    async fn list_runs(&self, workflow_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let rows = runs::list_runs(&self.pool, workflow_id).await?;
        rows.into_iter()
            .map(|row| row.into_run().map_err(StoreError::from))
            .collect()
    }

    async fn mark_run_running(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(runs::mark_run_running(&self.pool, id).await?)
    }

    async fn advance_run(
        &self,
        id: Uuid,
        current_step_index: u32,
        context: &RunContext,
    ) -> Result<(), StoreError> {
        let context = to_json(context, "context")?;
        Ok(runs::advance_run(&self.pool, id, current_step_index as i32, context).await?)
    }

    async fn complete_run(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(runs::complete_run(&self.pool, id).await?)
    }

    async fn fail_run(&self, id: Uuid, error: &RunError) -> Result<(), StoreError> {
        let error = to_json(error, "run error")?;
        Ok(runs::fail_run(&self.pool, id, error).await?)
    }

    async fn cancel_run(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(runs::cancel_run(&self.pool, id).await?)
    }

    async fn create_step_execution(
        &self,
        new: NewStepExecution,
    ) -> Result<StepExecution, StoreError> {
        let row = executions::create_step_execution(
            &self.pool,
            new.run_id,
            new.step_id,
            &new.step_name,
            new.attempt as i32,
            new.input,
        )
        .await?;
        Ok(row.into_step_execution()?)
    }

    async fn mark_step_execution_running(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(executions::mark_step_execution_running(&self.pool, id).await?)
    }

    async fn complete_step_execution(
        &self,
        id: Uuid,
        output: &Value,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        Ok(executions::complete_step_execution(
            &self.pool,
            id,
            output.clone(),
            duration_ms as i64,
        )
        .await?)
    }

    async fn fail_step_execution(
        &self,
        id: Uuid,
        error: &StepError,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let error = to_json(error, "step error")?;
        Ok(executions::fail_step_execution(&self.pool, id, error, duration_ms as i64).await?)
    }

    async fn list_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>, StoreError> {
        let rows = executions::list_step_executions(&self.pool, run_id).await?;
        rows.into_iter()
            .map(|row| row.into_step_execution().map_err(StoreError::from))
            .collect()
    }

    async fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(idempotency::find_run_by_idempotency_key(&self.pool, key).await?)
    }

    async fn bind_idempotency_key(&self, key: &str, run_id: Uuid) -> Result<(), StoreError> {
        Ok(idempotency::bind_idempotency_key(&self.pool, key, run_id, IDEMPOTENCY_TTL_HOURS)
            .await?)
    }

    async fn delete_expired_idempotency_keys(&self) -> Result<u64, StoreError> {
        Ok(idempotency::delete_expired_idempotency_keys(&self.pool).await?)
    }
}
