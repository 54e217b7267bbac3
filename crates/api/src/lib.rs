//! `api` crate — HTTP layer.
//!
//! Exposes:
//!   POST   /webhooks/:slug                       (trigger a run)
//!   GET    /api/v1/workflows
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows/:id
//!   DELETE /api/v1/workflows/:id
//!   GET    /api/v1/workflows/:id/runs
//!   POST   /api/v1/workflows/:id/steps
//!   DELETE /api/v1/workflows/:id/steps/:step_id
//!   GET    /api/v1/runs/:id
//!   GET    /api/v1/runs/:id/steps
//!   POST   /api/v1/runs/:id/cancel

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use engine::{Queue, RunStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub queue: Arc<dyn Queue>,
    pub max_steps_per_workflow: usize,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_router = Router::new()
        .route(
            "/workflows",
            get(handlers::workflows::list).post(handlers::workflows::create),
        )
        .route(
            "/workflows/:id",
            get(handlers::workflows::get).delete(handlers::workflows::delete),
        )
        .route("/workflows/:id/runs", get(handlers::runs::list_for_workflow))
        .route("/workflows/:id/steps", post(handlers::workflows::create_step))
        .route(
            "/workflows/:id/steps/:step_id",
            delete(handlers::workflows::delete_step),
        )
        .route("/runs/:id", get(handlers::runs::get))
        .route("/runs/:id/steps", get(handlers::runs::list_steps))
        .route("/runs/:id/cancel", post(handlers::runs::cancel));

    Router::new()
        .nest("/api/v1", api_router)
        .route("/webhooks/:slug", post(handlers::webhooks::handle_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(bind: &str, state: AppState) -> Result<(), std::io::Error> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
}
