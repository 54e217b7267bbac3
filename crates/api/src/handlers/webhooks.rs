//! Webhook admission — turns an inbound trigger into a queued run.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use engine::{JobMessage, Queue, QueueName, RunStore, TriggerData};

use super::AppState;
use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-webhook-signature";
const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

pub async fn handle_webhook(
    Path(slug): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let workflow = state
        .store
        .find_workflow_by_slug(&slug)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no workflow with slug '{slug}'")))?;

    if !workflow.enabled {
        return Err(ApiError::bad_request("workflow is disabled"));
    }

    if let Some(secret) = &workflow.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing webhook signature"))?;
        verify_signature(secret.as_bytes(), &body, signature)?;
    }

    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(key) = &idempotency_key {
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(ApiError::bad_request(format!(
                "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        if let Some(run_id) = state.store.find_run_by_idempotency_key(key).await? {
            let run = state.store.get_run(run_id).await?;
            return Ok((
                StatusCode::OK,
                Json(json!({
                    "runId": run.id,
                    "status": run.status,
                    "message": "Duplicate request",
                })),
            ));
        }
    }

    let body_json: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("request body is not valid JSON: {e}")))?
    };

    let trigger = TriggerData {
        method: "POST".to_string(),
        headers: headers
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect(),
        body: body_json,
        query,
        received_at: Utc::now(),
        source_ip: source_ip(&headers),
    };

    let run = state.store.create_run(workflow.id, trigger).await?;

    if let Some(key) = &idempotency_key {
        state.store.bind_idempotency_key(key, run.id).await?;
    }

    state
        .queue
        .enqueue(
            QueueName::Execute,
            JobMessage::StartRun {
                run_id: run.id,
                workflow_id: workflow.id,
            },
            Duration::ZERO,
        )
        .await?;

    tracing::info!(run_id = %run.id, workflow = %workflow.slug, "accepted webhook trigger");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "runId": run.id,
            "status": run.status,
            "workflowId": workflow.id,
        })),
    ))
}

/// Verify a GitHub-style `sha256=<hex>` signature over the raw body.
///
/// Comparison is constant-time via the hmac crate's `verify_slice`.
fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<(), ApiError> {
    let hex_signature = signature
        .strip_prefix("sha256=")
        .ok_or_else(|| ApiError::unauthorized("malformed webhook signature"))?;
    let expected =
        hex_decode(hex_signature).map_err(|_| ApiError::unauthorized("malformed webhook signature"))?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| ApiError::unauthorized("invalid webhook secret"))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::unauthorized("webhook signature mismatch"))
}

fn source_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use engine::{MemoryQueue, MemoryStore, NewStep, NewWorkflow, RunStore};
    use handlers::StepType;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("sha256={hex}")
    }

    async fn state_with_workflow(secret: Option<&str>, enabled: bool) -> (AppState, Arc<MemoryQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());

        store
            .create_workflow(NewWorkflow {
                name: "orders".into(),
                slug: "orders".into(),
                webhook_secret: secret.map(str::to_string),
                enabled,
                steps: vec![NewStep {
                    name: "fetch".into(),
                    step_type: StepType::Http,
                    config: serde_json::json!({ "method": "GET", "url": "https://x" }),
                    retry_policy: None,
                    timeout_ms: None,
                    enabled: true,
                }],
            })
            .await
            .unwrap();

        (
            AppState {
                store,
                queue: queue.clone(),
                max_steps_per_workflow: 20,
            },
            queue,
        )
    }

    async fn post_webhook(
        state: &AppState,
        slug: &str,
        headers: HeaderMap,
        body: &[u8],
    ) -> Result<(StatusCode, Json<Value>), ApiError> {
        handle_webhook(
            Path(slug.to_string()),
            Query(HashMap::new()),
            State(state.clone()),
            headers,
            Bytes::copy_from_slice(body),
        )
        .await
    }

    #[tokio::test]
    async fn accepted_trigger_creates_run_and_enqueues_start() {
        let (state, queue) = state_with_workflow(None, true).await;

        let (status, Json(body)) = post_webhook(&state, "orders", HeaderMap::new(), b"{\"id\":1}")
            .await
            .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        let run_id: uuid::Uuid = serde_json::from_value(body["runId"].clone()).unwrap();

        assert_eq!(queue.len(QueueName::Execute), 1);
        let run = state.store.get_run(run_id).await.unwrap();
        assert_eq!(run.trigger_data.body["id"], 1);
        assert_eq!(run.context.trigger["body"]["id"], 1);
    }

    #[tokio::test]
    async fn unknown_slug_is_404() {
        let (state, _) = state_with_workflow(None, true).await;
        let err = post_webhook(&state, "nope", HeaderMap::new(), b"{}")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disabled_workflow_is_400() {
        let (state, _) = state_with_workflow(None, false).await;
        let err = post_webhook(&state, "orders", HeaderMap::new(), b"{}")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_signature_is_401_when_secret_is_set() {
        let (state, queue) = state_with_workflow(Some("s3cret"), true).await;
        let err = post_webhook(&state, "orders", HeaderMap::new(), b"{}")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(queue.is_empty(QueueName::Execute));
    }

    #[tokio::test]
    async fn bad_signature_is_401() {
        let (state, _) = state_with_workflow(Some("s3cret"), true).await;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            sign("wrong-secret", b"{}").parse().unwrap(),
        );
        let err = post_webhook(&state, "orders", headers, b"{}")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_signature_is_accepted() {
        let (state, _) = state_with_workflow(Some("s3cret"), true).await;
        let body = br#"{"payload":true}"#;
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sign("s3cret", body).parse().unwrap());
        let (status, _) = post_webhook(&state, "orders", headers, body).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_the_same_run() {
        let (state, queue) = state_with_workflow(None, true).await;

        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_HEADER, "abc-123".parse().unwrap());

        let (status, Json(first)) = post_webhook(&state, "orders", headers.clone(), b"{\"n\":1}")
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        // Different body, same key: replayed, body discarded.
        let (status, Json(second)) = post_webhook(&state, "orders", headers, b"{\"n\":2}")
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["message"], "Duplicate request");
        assert_eq!(second["runId"], first["runId"]);

        // Only the first request enqueued a StartRun.
        assert_eq!(queue.len(QueueName::Execute), 1);
        let run_id: uuid::Uuid = serde_json::from_value(first["runId"].clone()).unwrap();
        let run = state.store.get_run(run_id).await.unwrap();
        assert_eq!(run.trigger_data.body["n"], 1);
    }

    #[tokio::test]
    async fn oversized_idempotency_key_is_400() {
        let (state, _) = state_with_workflow(None, true).await;
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_HEADER, "k".repeat(300).parse().unwrap());
        let err = post_webhook(&state, "orders", headers, b"{}")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_json_body_is_400() {
        let (state, _) = state_with_workflow(None, true).await;
        let err = post_webhook(&state, "orders", HeaderMap::new(), b"not json")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn source_ip_comes_from_forwarded_header() {
        let (state, _) = state_with_workflow(None, true).await;
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let (_, Json(body)) = post_webhook(&state, "orders", headers, b"{}")
            .await
            .unwrap();
        let run_id: uuid::Uuid = serde_json::from_value(body["runId"].clone()).unwrap();
        let run = state.store.get_run(run_id).await.unwrap();
        assert_eq!(run.trigger_data.source_ip.as_deref(), Some("203.0.113.9"));
    }
}
