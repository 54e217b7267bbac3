//! Postgres connection pool, sized from the engine configuration.

use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use engine::EngineConfig;

use crate::DbError;

/// Type alias for the shared Postgres pool used across the whole application.
pub type DbPool = PgPool;

/// Embedded migrations from `migrations/` at the workspace root.
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// A connection request past this wait means the pool ceiling is too low
/// for the configured worker counts.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the pool described by the engine configuration.
///
/// `database_pool_size` is shared by the API process and every worker task
/// in a worker process; repository calls are the only consumers.
pub async fn connect(config: &EngineConfig) -> Result<DbPool, DbError> {
    info!(
        max_connections = config.database_pool_size,
        "connecting to database"
    );
    let pool = PgPoolOptions::new()
        .max_connections(config.database_pool_size)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

/// Apply any pending embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    let latest = MIGRATOR.iter().map(|m| m.version).max().unwrap_or(0);
    info!(
        migrations = MIGRATOR.iter().count(),
        latest_version = latest,
        "applying database migrations"
    );
    MIGRATOR.run(pool).await?;
    Ok(())
}
