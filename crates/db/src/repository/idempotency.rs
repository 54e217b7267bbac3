//! Idempotency key repository functions.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbError;

/// Bind a key to a run. First writer wins for the key's lifetime; an
/// expired binding is replaced in place.
pub async fn bind_idempotency_key(
    pool: &PgPool,
    key: &str,
    run_id: Uuid,
    ttl_hours: i64,
) -> Result<(), DbError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO idempotency_keys (key, run_id, created_at, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (key) DO UPDATE
            SET run_id = EXCLUDED.run_id,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_keys.expires_at <= EXCLUDED.created_at
        "#,
    )
    .bind(key)
    .bind(run_id)
    .bind(now)
    .bind(now + Duration::hours(ttl_hours))
    .execute(pool)
    .await?;
    Ok(())
}

/// The bound run id, iff the key exists and has not expired.
pub async fn find_run_by_idempotency_key(
    pool: &PgPool,
    key: &str,
) -> Result<Option<Uuid>, DbError> {
    let run_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT run_id FROM idempotency_keys WHERE key = $1 AND expires_at > $2",
    )
    .bind(key)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;
    Ok(run_id)
}

/// Drop expired keys; returns how many rows were removed.
pub async fn delete_expired_idempotency_keys(pool: &PgPool) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < $1")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
