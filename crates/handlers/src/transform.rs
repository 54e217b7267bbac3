//! Transform step — evaluates one expression against the run context.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ErrorCategory, StepError};
use crate::expression::evaluate_transform;
use crate::traits::{RunContext, StepHandler};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformConfig {
    expression: String,
    output_key: String,
}

pub struct TransformHandler;

#[async_trait]
impl StepHandler for TransformHandler {
    async fn execute(&self, input: &Value, ctx: &RunContext) -> Result<Value, StepError> {
        let config: TransformConfig = serde_json::from_value(input.clone()).map_err(|e| {
            StepError::new(
                "INVALID_CONFIG",
                format!("invalid transform step config: {e}"),
                ErrorCategory::Validation,
            )
        })?;

        let result = evaluate_transform(&config.expression, ctx).map_err(|e| {
            StepError::new("TRANSFORM_ERROR", e.to_string(), ErrorCategory::Validation)
                .with_details(serde_json::json!({ "expression": config.expression }))
        })?;

        Ok(serde_json::json!({ config.output_key: result }))
    }
}
