//! `hookflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — start the HTTP API (webhook admission + REST).
//! - `worker`   — start a queue worker process.
//! - `migrate`  — run pending database migrations.
//! - `validate` — validate a workflow definition JSON file.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use api::AppState;
use engine::{
    EngineConfig, LockManager, Queue, RedisLockManager, RedisQueue, RunProcessor, RunStore,
    WorkerConfig, WorkerPool,
};
use handlers::{builtin_registry, HandlerSettings};

#[derive(Parser)]
#[command(
    name = "hookflow",
    about = "Webhook-triggered workflow automation engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API server.
    Serve,
    /// Start a background worker that processes queued run messages.
    Worker,
    /// Run pending database migrations.
    Migrate {
        /// Override the DATABASE_URL the environment provides.
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve => {
            let config = EngineConfig::from_env();
            let bind = format!("{}:{}", config.host, config.port);
            info!("Starting API server on {bind}");

            let pool = db::pool::connect(&config)
                .await
                .expect("failed to connect to database");
            let redis = engine::storage::redis::create_pool(&config.redis_url)
                .expect("failed to create redis pool");

            let state = AppState {
                store: Arc::new(db::PgStore::new(pool)),
                queue: Arc::new(RedisQueue::new(redis)),
                max_steps_per_workflow: config.max_steps_per_workflow,
            };
            api::serve(&bind, state).await.unwrap();
        }
        Command::Worker => {
            let config = EngineConfig::from_env();
            info!(
                execute_workers = config.execute_workers,
                ai_workers = config.ai_workers,
                "Starting background worker"
            );

            let pool = db::pool::connect(&config)
                .await
                .expect("failed to connect to database");
            let redis = engine::storage::redis::create_pool(&config.redis_url)
                .expect("failed to create redis pool");

            let store: Arc<dyn RunStore> = Arc::new(db::PgStore::new(pool));
            let queue: Arc<dyn Queue> = Arc::new(RedisQueue::new(redis.clone()));
            let lock: Arc<dyn LockManager> = Arc::new(RedisLockManager::new(redis));
            let registry = builtin_registry(&HandlerSettings {
                llm_base_url: config.llm_base_url.clone(),
            });

            let processor = Arc::new(RunProcessor::new(
                store.clone(),
                queue.clone(),
                lock,
                registry,
                config.limits.clone(),
            ));
            let workers = WorkerPool::spawn(
                processor,
                queue,
                store,
                WorkerConfig {
                    execute_workers: config.execute_workers,
                    ai_workers: config.ai_workers,
                    ..WorkerConfig::default()
                },
            );

            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            info!("shutting down workers");
            workers.shutdown().await;
        }
        Command::Migrate { database_url } => {
            let mut config = EngineConfig::from_env();
            if let Some(url) = database_url {
                config.database_url = url;
            }
            // Migrations run sequentially; a worker-sized pool is wasted here.
            config.database_pool_size = config.database_pool_size.min(2);

            let pool = db::pool::connect(&config)
                .await
                .expect("failed to connect to database");
            db::pool::run_migrations(&pool)
                .await
                .expect("failed to apply migrations");
            info!("database is up to date");
        }
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("cannot read file {}: {e}", path.display()));

            let workflow: api::handlers::workflows::CreateWorkflowDto =
                serde_json::from_str(&content).unwrap_or_else(|e| panic!("invalid JSON: {e}"));

            let max_steps = EngineConfig::from_env().max_steps_per_workflow;
            match api::handlers::workflows::validate_workflow(&workflow, max_steps) {
                Ok(()) => {
                    println!(
                        "✅ Workflow '{}' is valid ({} steps)",
                        workflow.slug,
                        workflow.steps.len()
                    );
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {}", e.message);
                    std::process::exit(1);
                }
            }
        }
    }
}
