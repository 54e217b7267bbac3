//! AI step — chat completion against an OpenAI-compatible endpoint.
//!
//! Targets local inference servers (LM Studio and friends) but works with
//! anything speaking `/v1/chat/completions`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ErrorCategory, StepError};
use crate::traits::{RunContext, StepHandler};

/// AI calls get a generous fixed ceiling; local models can be slow.
const AI_TIMEOUT: Duration = Duration::from_secs(300);

fn default_model() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiConfig {
    #[serde(default = "default_model")]
    model: String,
    prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f64>,
    output_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct AiHandler {
    client: Client,
    base_url: String,
}

impl AiHandler {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StepHandler for AiHandler {
    async fn execute(&self, input: &Value, _ctx: &RunContext) -> Result<Value, StepError> {
        let config: AiConfig = serde_json::from_value(input.clone()).map_err(|e| {
            StepError::new(
                "INVALID_CONFIG",
                format!("invalid ai step config: {e}"),
                ErrorCategory::Validation,
            )
        })?;

        if let Some(t) = config.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(StepError::new(
                    "INVALID_CONFIG",
                    format!("temperature must be within [0, 2], got {t}"),
                    ErrorCategory::Validation,
                ));
            }
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &config.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": config.prompt }));

        let mut request_body = serde_json::json!({
            "model": config.model,
            "messages": messages,
        });
        if let Some(max_tokens) = config.max_tokens {
            request_body["max_tokens"] = max_tokens.into();
        }
        if let Some(temperature) = config.temperature {
            request_body["temperature"] = serde_json::json!(temperature);
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .timeout(AI_TIMEOUT)
            .json(&request_body)
            .send()
            .await
            .map_err(map_ai_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response
                .text()
                .await
                .map(Value::String)
                .unwrap_or(Value::Null);
            return Err(StepError::from_http_status(status, body));
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            StepError::new(
                "AI_NO_RESPONSE",
                format!("malformed completion response: {e}"),
                ErrorCategory::Transient,
            )
        })?;

        let content = completion
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                StepError::new(
                    "AI_NO_RESPONSE",
                    "model returned no choices",
                    ErrorCategory::Transient,
                )
            })?;

        Ok(serde_json::json!({
            config.output_key: content,
            "_meta": { "usage": completion.usage.unwrap_or(Value::Null) },
        }))
    }
}

fn map_ai_error(err: reqwest::Error) -> StepError {
    if err.is_timeout() {
        StepError::new(
            "AI_TIMEOUT",
            format!("ai request timed out: {err}"),
            ErrorCategory::Transient,
        )
    } else if err.is_connect() {
        StepError::new(
            "AI_UNAVAILABLE",
            format!("ai endpoint unreachable: {err}"),
            ErrorCategory::Transient,
        )
    } else {
        StepError::classify(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_defaults() {
        let config: AiConfig = serde_json::from_value(json!({
            "prompt": "summarize this",
            "outputKey": "summary",
        }))
        .unwrap();
        assert_eq!(config.model, "default");
        assert!(config.system_prompt.is_none());
        assert!(config.max_tokens.is_none());
    }

    #[tokio::test]
    async fn out_of_range_temperature_is_rejected() {
        let handler = AiHandler::new("http://localhost:1234");
        let err = handler
            .execute(
                &json!({ "prompt": "hi", "outputKey": "out", "temperature": 3.5 }),
                &RunContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_CONFIG");
        assert_eq!(err.category, ErrorCategory::Validation);
    }

    #[test]
    fn empty_choices_deserializes() {
        let completion: ChatCompletionResponse = serde_json::from_value(json!({})).unwrap();
        assert!(completion.choices.is_empty());
        assert!(completion.usage.is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let handler = AiHandler::new("http://localhost:1234/");
        assert_eq!(handler.base_url, "http://localhost:1234");
    }
}
