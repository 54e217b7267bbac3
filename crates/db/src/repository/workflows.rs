//! Workflow and step CRUD operations.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    models::{StepRow, WorkflowRow},
    DbError,
};

const WORKFLOW_COLUMNS: &str =
    "id, name, slug, webhook_secret, enabled, created_at, updated_at";
const STEP_COLUMNS: &str =
    r#"id, workflow_id, "order", name, type, config, retry_policy, timeout_ms, enabled"#;

/// Insert arguments for one step; `order` is assigned by the caller.
pub struct StepInsert {
    pub name: String,
    pub step_type: String,
    pub config: Value,
    pub retry_policy: Option<Value>,
    pub timeout_ms: Option<i64>,
    pub enabled: bool,
}

/// Insert a workflow together with its steps (orders `0..n`) in one
/// transaction.
pub async fn create_workflow(
    pool: &PgPool,
    name: &str,
    slug: &str,
    webhook_secret: Option<&str>,
    enabled: bool,
    steps: Vec<StepInsert>,
) -> Result<(WorkflowRow, Vec<StepRow>), DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let workflow = sqlx::query_as::<_, WorkflowRow>(&format!(
        r#"
        INSERT INTO workflows (id, name, slug, webhook_secret, enabled, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        RETURNING {WORKFLOW_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(name)
    .bind(slug)
    .bind(webhook_secret)
    .bind(enabled)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    let mut step_rows = Vec::with_capacity(steps.len());
    for (order, step) in steps.into_iter().enumerate() {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            INSERT INTO steps (id, workflow_id, "order", name, type, config, retry_policy, timeout_ms, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(order as i32)
        .bind(step.name)
        .bind(step.step_type)
        .bind(step.config)
        .bind(step.retry_policy)
        .bind(step.timeout_ms)
        .bind(step.enabled)
        .fetch_one(&mut *tx)
        .await?;
        step_rows.push(row);
    }

    tx.commit().await?;
    Ok((workflow, step_rows))
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, DbError> {
    sqlx::query_as::<_, WorkflowRow>(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Fetch a workflow by its webhook slug.
pub async fn find_workflow_by_slug(
    pool: &PgPool,
    slug: &str,
) -> Result<Option<WorkflowRow>, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE slug = $1"
    ))
    .bind(slug)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Return all workflows ordered by creation time (newest first).
pub async fn list_workflows(pool: &PgPool) -> Result<Vec<WorkflowRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The steps of one workflow, ordered by `order`.
pub async fn list_steps(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<StepRow>, DbError> {
    let rows = sqlx::query_as::<_, StepRow>(&format!(
        r#"SELECT {STEP_COLUMNS} FROM steps WHERE workflow_id = $1 ORDER BY "order" ASC"#
    ))
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Permanently delete a workflow (steps/runs cascade).
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_workflow(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Append a step at the end of the workflow's order sequence.
pub async fn create_step(
    pool: &PgPool,
    workflow_id: Uuid,
    step: StepInsert,
) -> Result<StepRow, DbError> {
    let mut tx = pool.begin().await?;

    let next_order: i32 = sqlx::query_scalar(
        r#"SELECT COALESCE(MAX("order") + 1, 0) FROM steps WHERE workflow_id = $1"#,
    )
    .bind(workflow_id)
    .fetch_one(&mut *tx)
    .await?;

    let row = sqlx::query_as::<_, StepRow>(&format!(
        r#"
        INSERT INTO steps (id, workflow_id, "order", name, type, config, retry_policy, timeout_ms, enabled)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(workflow_id)
    .bind(next_order)
    .bind(step.name)
    .bind(step.step_type)
    .bind(step.config)
    .bind(step.retry_policy)
    .bind(step.timeout_ms)
    .bind(step.enabled)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE workflows SET updated_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(workflow_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(row)
}

/// Delete a step and re-densify the surviving orders to `[0..n)`, all in
/// one transaction.
pub async fn delete_step(pool: &PgPool, workflow_id: Uuid, step_id: Uuid) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query("DELETE FROM steps WHERE id = $1 AND workflow_id = $2")
        .bind(step_id)
        .bind(workflow_id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    // Ascending renumbering only ever moves a step into a freed slot, so
    // the UNIQUE(workflow_id, "order") constraint is never violated mid-way.
    let survivors: Vec<Uuid> = sqlx::query_scalar(
        r#"SELECT id FROM steps WHERE workflow_id = $1 ORDER BY "order" ASC"#,
    )
    .bind(workflow_id)
    .fetch_all(&mut *tx)
    .await?;

    for (order, id) in survivors.iter().enumerate() {
        sqlx::query(r#"UPDATE steps SET "order" = $1 WHERE id = $2"#)
            .bind(order as i32)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("UPDATE workflows SET updated_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(workflow_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
