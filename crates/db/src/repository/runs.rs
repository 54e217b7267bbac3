//! Run repository functions.
//!
//! Status transitions are conditional `UPDATE … WHERE status = …` writes so
//! a stale worker can never resurrect a terminal run.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::RunRow, DbError};

const RUN_COLUMNS: &str = "id, workflow_id, status, trigger_data, context, \
                           current_step_index, started_at, completed_at, error";

/// Create a new run in `pending` status.
pub async fn create_run(
    pool: &PgPool,
    workflow_id: Uuid,
    trigger_data: Value,
    context: Value,
) -> Result<RunRow, DbError> {
    let row = sqlx::query_as::<_, RunRow>(&format!(
        r#"
        INSERT INTO runs (id, workflow_id, status, trigger_data, context, current_step_index, started_at)
        VALUES ($1, $2, 'pending', $3, $4, 0, $5)
        RETURNING {RUN_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(workflow_id)
    .bind(trigger_data)
    .bind(context)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Fetch a single run by its primary key.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<RunRow, DbError> {
    sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// All runs of one workflow, newest first.
pub async fn list_runs(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<RunRow>, DbError> {
    let rows = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_id = $1 ORDER BY started_at DESC"
    ))
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// pending → running.
pub async fn mark_run_running(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    sqlx::query("UPDATE runs SET status = 'running' WHERE id = $1 AND status = 'pending'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Persist step progress: advanced index plus grown context.
pub async fn advance_run(
    pool: &PgPool,
    id: Uuid,
    current_step_index: i32,
    context: Value,
) -> Result<(), DbError> {
    sqlx::query("UPDATE runs SET current_step_index = $1, context = $2 WHERE id = $3")
        .bind(current_step_index)
        .bind(context)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// running → completed.
pub async fn complete_run(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE runs SET status = 'completed', completed_at = $1 \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// running → failed, recording the terminal error.
pub async fn fail_run(pool: &PgPool, id: Uuid, error: Value) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE runs SET status = 'failed', completed_at = $1, error = $2 \
         WHERE id = $3 AND status = 'running'",
    )
    .bind(Utc::now())
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// pending/running → cancelled. Returns whether a row transitioned.
pub async fn cancel_run(pool: &PgPool, id: Uuid) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'cancelled', completed_at = $1 \
         WHERE id = $2 AND status IN ('pending', 'running')",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
