//! Workflow and step authoring endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use engine::models::is_valid_slug;
use engine::{NewStep, NewWorkflow, RetryPolicy, RunStore, Step, Workflow};
use handlers::StepType;

use super::AppState;
use crate::error::ApiError;

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowDto {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub steps: Vec<StepDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDto {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub config: Value,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StepDto {
    fn validate(&self) -> Result<(), ApiError> {
        if self.name.is_empty() || self.name.len() > 100 {
            return Err(ApiError::bad_request(format!(
                "step name must be 1..=100 characters, got {}",
                self.name.len()
            )));
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate().map_err(ApiError::bad_request)?;
        }
        if matches!(self.timeout_ms, Some(0)) {
            return Err(ApiError::bad_request("timeoutMs must be positive"));
        }
        validate_step_config(self.step_type, &self.config).map_err(ApiError::bad_request)
    }

    fn into_new_step(self) -> NewStep {
        NewStep {
            name: self.name,
            step_type: self.step_type,
            config: self.config,
            retry_policy: self.retry_policy,
            timeout_ms: self.timeout_ms,
            enabled: self.enabled,
        }
    }
}

/// Shape checks on a step config, discriminated by step type. Placeholders
/// are resolved per run, so only structure is checked here, not values.
fn validate_step_config(step_type: StepType, config: &Value) -> Result<(), String> {
    let object = config
        .as_object()
        .ok_or_else(|| "config must be an object".to_string())?;

    let require_string = |key: &str| -> Result<(), String> {
        match object.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(()),
            Some(_) => Err(format!("config.{key} must be a non-empty string")),
            None => Err(format!("config.{key} is required")),
        }
    };

    match step_type {
        StepType::Http => {
            require_string("url")?;
            match object.get("method").and_then(Value::as_str) {
                Some("GET" | "POST" | "PUT" | "PATCH" | "DELETE") => Ok(()),
                Some(other) => Err(format!("unsupported HTTP method: {other}")),
                None => Err("config.method is required".to_string()),
            }
        }
        StepType::Transform => {
            require_string("expression")?;
            require_string("outputKey")
        }
        StepType::Ai => {
            require_string("prompt")?;
            require_string("outputKey")?;
            match object.get("temperature") {
                None => Ok(()),
                Some(value) => match value.as_f64() {
                    Some(t) if (0.0..=2.0).contains(&t) => Ok(()),
                    _ => Err("config.temperature must be within [0, 2]".to_string()),
                },
            }
        }
        StepType::Delay => match object.get("durationMs").and_then(Value::as_i64) {
            Some(ms) if ms > 0 => Ok(()),
            Some(_) => Err("config.durationMs must be positive".to_string()),
            None => Err("config.durationMs is required".to_string()),
        },
    }
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Workflow>>, ApiError> {
    Ok(Json(state.store.list_workflows().await?))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.store.get_workflow(id).await?))
}

/// All authoring checks for a workflow payload; shared by the create
/// endpoint and the CLI's `validate` command.
pub fn validate_workflow(payload: &CreateWorkflowDto, max_steps: usize) -> Result<(), ApiError> {
    if !is_valid_slug(&payload.slug) {
        return Err(ApiError::bad_request(
            "slug must be 1..=100 characters of [a-z0-9-]",
        ));
    }
    if payload.name.is_empty() || payload.name.len() > 100 {
        return Err(ApiError::bad_request("name must be 1..=100 characters"));
    }
    if payload.steps.len() > max_steps {
        return Err(ApiError::bad_request(format!(
            "workflow exceeds the {max_steps} step limit"
        )));
    }
    for step in &payload.steps {
        step.validate()?;
    }
    Ok(())
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowDto>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    validate_workflow(&payload, state.max_steps_per_workflow)?;

    let workflow = state
        .store
        .create_workflow(NewWorkflow {
            name: payload.name,
            slug: payload.slug,
            webhook_secret: payload.webhook_secret,
            enabled: payload.enabled,
            steps: payload.steps.into_iter().map(StepDto::into_new_step).collect(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn delete(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_workflow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_step(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<StepDto>,
) -> Result<(StatusCode, Json<Step>), ApiError> {
    payload.validate()?;

    let workflow = state.store.get_workflow(id).await?;
    if workflow.steps.len() >= state.max_steps_per_workflow {
        return Err(ApiError::bad_request(format!(
            "workflow already has the maximum of {} steps",
            state.max_steps_per_workflow
        )));
    }

    let step = state
        .store
        .create_step(id, payload.into_new_step())
        .await?;
    Ok((StatusCode::CREATED, Json(step)))
}

pub async fn delete_step(
    Path((id, step_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_step(id, step_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
