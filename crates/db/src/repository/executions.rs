//! Step execution repository functions.
//!
//! Rows are append-only per `(run_id, step_id, attempt)`; the only
//! mutations are the status/output/error/completion fields written by the
//! processor that created the row.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::StepExecutionRow, DbError};

const EXECUTION_COLUMNS: &str = "id, run_id, step_id, step_name, status, attempt, input, \
                                 output, error, started_at, completed_at, duration_ms";

/// Insert a new execution attempt in `pending` status.
pub async fn create_step_execution(
    pool: &PgPool,
    run_id: Uuid,
    step_id: Uuid,
    step_name: &str,
    attempt: i32,
    input: Value,
) -> Result<StepExecutionRow, DbError> {
    let row = sqlx::query_as::<_, StepExecutionRow>(&format!(
        r#"
        INSERT INTO step_executions (id, run_id, step_id, step_name, status, attempt, input, started_at)
        VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
        RETURNING {EXECUTION_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(run_id)
    .bind(step_id)
    .bind(step_name)
    .bind(attempt)
    .bind(input)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn mark_step_execution_running(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    sqlx::query("UPDATE step_executions SET status = 'running' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn complete_step_execution(
    pool: &PgPool,
    id: Uuid,
    output: Value,
    duration_ms: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE step_executions \
         SET status = 'completed', output = $1, completed_at = $2, duration_ms = $3 \
         WHERE id = $4",
    )
    .bind(output)
    .bind(Utc::now())
    .bind(duration_ms)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail_step_execution(
    pool: &PgPool,
    id: Uuid,
    error: Value,
    duration_ms: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE step_executions \
         SET status = 'failed', error = $1, completed_at = $2, duration_ms = $3 \
         WHERE id = $4",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(duration_ms)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// All executions of one run, oldest first.
pub async fn list_step_executions(
    pool: &PgPool,
    run_id: Uuid,
) -> Result<Vec<StepExecutionRow>, DbError> {
    let rows = sqlx::query_as::<_, StepExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM step_executions \
         WHERE run_id = $1 ORDER BY started_at ASC"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
