//! Run inspection and cancellation endpoints.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use engine::{Run, RunStore, StepExecution};

use super::AppState;
use crate::error::ApiError;

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.store.get_run(id).await?))
}

pub async fn list_steps(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Vec<StepExecution>>, ApiError> {
    // 404 for unknown runs rather than an empty list.
    state.store.get_run(id).await?;
    Ok(Json(state.store.list_step_executions(id).await?))
}

pub async fn list_for_workflow(
    Path(workflow_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Run>>, ApiError> {
    state.store.get_workflow(workflow_id).await?;
    Ok(Json(state.store.list_runs(workflow_id).await?))
}

/// Cancel a pending or running run.
///
/// In-flight step handlers are not interrupted; the next processor cycle
/// observes the cancelled status and stops without writing further state.
pub async fn cancel(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Run>, ApiError> {
    let transitioned = state.store.cancel_run(id).await?;
    if !transitioned {
        let run = state.store.get_run(id).await?;
        return Err(ApiError::conflict(format!(
            "run is already {}, cannot cancel",
            run.status
        )));
    }
    Ok(Json(state.store.get_run(id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::http::StatusCode;
    use engine::{
        MemoryQueue, MemoryStore, NewWorkflow, RunStatus, RunStore, TriggerData,
    };
    use serde_json::json;

    async fn state_with_run() -> (AppState, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let workflow = store
            .create_workflow(NewWorkflow {
                name: "wf".into(),
                slug: "wf".into(),
                webhook_secret: None,
                enabled: true,
                steps: vec![],
            })
            .await
            .unwrap();
        let run = store
            .create_run(
                workflow.id,
                TriggerData {
                    method: "POST".into(),
                    headers: HashMap::new(),
                    body: json!({}),
                    query: HashMap::new(),
                    received_at: chrono::Utc::now(),
                    source_ip: None,
                },
            )
            .await
            .unwrap();
        (
            AppState {
                store,
                queue: Arc::new(MemoryQueue::new()),
                max_steps_per_workflow: 20,
            },
            run.id,
        )
    }

    #[tokio::test]
    async fn cancel_transitions_a_pending_run() {
        let (state, run_id) = state_with_run().await;
        let Json(run) = cancel(Path(run_id), State(state)).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancelling_a_terminal_run_is_a_conflict() {
        let (state, run_id) = state_with_run().await;
        cancel(Path(run_id), State(state.clone())).await.unwrap();
        let err = cancel(Path(run_id), State(state)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let (state, _) = state_with_run().await;
        let err = get(Path(Uuid::new_v4()), State(state)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
