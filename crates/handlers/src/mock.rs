//! `MockHandler` — a test double for `StepHandler`.
//!
//! Useful in unit and integration tests where a real handler is either
//! unavailable or irrelevant. Supports scripted per-attempt outcomes so
//! retry behaviour can be exercised deterministically.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ErrorCategory, StepError};
use crate::traits::{RunContext, StepHandler};

/// What the mock does on one invocation.
#[derive(Clone)]
pub enum MockOutcome {
    /// Succeed with this value.
    Succeed(Value),
    /// Fail with the given classified error.
    Fail(StepError),
}

impl MockOutcome {
    pub fn transient(code: &str, message: &str) -> Self {
        Self::Fail(StepError::new(code, message, ErrorCategory::Transient))
    }

    pub fn fatal(code: &str, message: &str) -> Self {
        Self::Fail(StepError::new(code, message, ErrorCategory::Fatal))
    }
}

/// A mock handler that records every call and replays a scripted sequence
/// of outcomes; the last outcome repeats once the script is exhausted.
pub struct MockHandler {
    script: Vec<MockOutcome>,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl MockHandler {
    /// Always succeed with the given value.
    pub fn returning(value: Value) -> Self {
        Self::scripted(vec![MockOutcome::Succeed(value)])
    }

    /// Always fail with the given error.
    pub fn failing(error: StepError) -> Self {
        Self::scripted(vec![MockOutcome::Fail(error)])
    }

    /// Replay the given outcomes attempt by attempt.
    pub fn scripted(script: Vec<MockOutcome>) -> Self {
        assert!(!script.is_empty(), "mock script must not be empty");
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// All inputs seen by this handler, in call order.
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepHandler for MockHandler {
    async fn execute(&self, input: &Value, _ctx: &RunContext) -> Result<Value, StepError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(input.clone());
            calls.len() - 1
        };

        let outcome = self
            .script
            .get(attempt)
            .unwrap_or_else(|| self.script.last().unwrap());
        match outcome {
            MockOutcome::Succeed(value) => Ok(value.clone()),
            MockOutcome::Fail(error) => Err(error.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_outcomes_replay_in_order() {
        let handler = MockHandler::scripted(vec![
            MockOutcome::transient("HTTP_500", "server error"),
            MockOutcome::Succeed(json!({ "ok": true })),
        ]);
        let ctx = RunContext::default();

        let first = handler.execute(&json!({}), &ctx).await;
        assert!(first.is_err());

        let second = handler.execute(&json!({}), &ctx).await.unwrap();
        assert_eq!(second, json!({ "ok": true }));

        // Script exhausted: the last outcome repeats.
        let third = handler.execute(&json!({}), &ctx).await.unwrap();
        assert_eq!(third, json!({ "ok": true }));
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn inputs_are_recorded() {
        let handler = MockHandler::returning(json!(null));
        handler
            .execute(&json!({ "a": 1 }), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(handler.calls(), vec![json!({ "a": 1 })]);
    }
}
