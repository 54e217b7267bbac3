//! Delay step.
//!
//! Returns immediately — the actual wait is expressed as the delivery delay
//! of the *next* queue message, so a sleeping run never occupies a worker.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ErrorCategory, StepError};
use crate::traits::{RunContext, StepHandler};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayConfig {
    duration_ms: i64,
}

pub struct DelayHandler;

#[async_trait]
impl StepHandler for DelayHandler {
    async fn execute(&self, input: &Value, _ctx: &RunContext) -> Result<Value, StepError> {
        let config: DelayConfig = serde_json::from_value(input.clone()).map_err(|e| {
            StepError::new(
                "INVALID_CONFIG",
                format!("invalid delay step config: {e}"),
                ErrorCategory::Validation,
            )
        })?;

        if config.duration_ms <= 0 {
            return Err(StepError::new(
                "INVALID_CONFIG",
                format!("durationMs must be positive, got {}", config.duration_ms),
                ErrorCategory::Validation,
            ));
        }

        let delayed_until = Utc::now() + ChronoDuration::milliseconds(config.duration_ms);
        Ok(serde_json::json!({
            "delayMs": config.duration_ms,
            "delayedUntil": delayed_until.to_rfc3339_opts(SecondsFormat::Millis, true),
        }))
    }
}
