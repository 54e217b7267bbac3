//! HTTP request step.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ErrorCategory, StepError};
use crate::traits::{RunContext, StepHandler};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Resolved config for an http step.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpConfig {
    method: HttpMethod,
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

pub struct HttpHandler {
    client: Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepHandler for HttpHandler {
    async fn execute(&self, input: &Value, _ctx: &RunContext) -> Result<Value, StepError> {
        let config: HttpConfig = serde_json::from_value(input.clone()).map_err(|e| {
            StepError::new(
                "INVALID_CONFIG",
                format!("invalid http step config: {e}"),
                ErrorCategory::Validation,
            )
        })?;

        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let mut request = self
            .client
            .request(config.method.into(), &config.url)
            .timeout(timeout);

        for (name, value) in merged_headers(&config.headers) {
            request = request.header(name, value);
        }

        if config.method != HttpMethod::Get {
            if let Some(body) = &config.body {
                request = request.body(serde_json::to_string(body).map_err(|e| {
                    StepError::new(
                        "INVALID_CONFIG",
                        format!("unserializable request body: {e}"),
                        ErrorCategory::Validation,
                    )
                })?);
            }
        }

        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect();

        let is_json = headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v.contains("application/json"));

        let text = response.text().await.map_err(map_transport_error)?;
        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        if !(200..300).contains(&status) {
            return Err(StepError::from_http_status(status, body));
        }

        Ok(serde_json::json!({
            "status": status,
            "headers": headers,
            "body": body,
        }))
    }
}

/// Configured headers on top of the JSON default; a caller-supplied
/// content type wins whatever its casing.
fn merged_headers(configured: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(configured.len() + 1);
    let has_content_type = configured
        .keys()
        .any(|k| k.eq_ignore_ascii_case("content-type"));
    if !has_content_type {
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
    }
    for (name, value) in configured {
        headers.push((name.clone(), value.clone()));
    }
    headers
}

fn map_transport_error(err: reqwest::Error) -> StepError {
    if err.is_timeout() {
        StepError::new(
            "TIMEOUT",
            format!("http request timed out: {err}"),
            ErrorCategory::Transient,
        )
    } else if err.is_connect() {
        StepError::new(
            "NETWORK_ERROR",
            format!("http connection failed: {err}"),
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
    fn config_parses_with_defaults() {
        let config: HttpConfig = serde_json::from_value(json!({
            "method": "GET",
            "url": "https://example.com/echo",
        }))
        .unwrap();
        assert_eq!(config.method, HttpMethod::Get);
        assert!(config.headers.is_empty());
        assert!(config.body.is_none());
        assert!(config.timeout_ms.is_none());
    }

    #[test]
    fn unknown_method_is_rejected() {
        let result: Result<HttpConfig, _> = serde_json::from_value(json!({
            "method": "TRACE",
            "url": "https://example.com",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn default_content_type_is_applied() {
        let headers = merged_headers(&HashMap::new());
        assert_eq!(
            headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn configured_content_type_wins_case_insensitively() {
        let mut configured = HashMap::new();
        configured.insert("content-type".to_string(), "text/plain".to_string());
        let headers = merged_headers(&configured);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].1, "text/plain");
    }

    #[tokio::test]
    async fn bad_config_fails_validation() {
        let handler = HttpHandler::new();
        let err = handler
            .execute(&json!({ "url": "https://example.com" }), &RunContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_CONFIG");
        assert_eq!(err.category, ErrorCategory::Validation);
    }
}
