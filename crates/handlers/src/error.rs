//! Step-level error classification.
//!
//! Every failure that crosses a handler boundary is a [`StepError`] value:
//! `{code, message, category, details}`. The engine uses the category — not
//! the concrete failure — to decide retry behaviour:
//! - `Transient` / `Resource` — the step is re-enqueued with back-off.
//! - everything else — the run is immediately marked as failed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure category, ordered from "retry will probably help" to "it won't".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Network errors, request timeouts, HTTP 5xx, HTTP 429.
    Transient,
    /// Pool/connection exhaustion.
    Resource,
    /// HTTP 401/403.
    Authorization,
    /// HTTP 404.
    NotFound,
    /// Other HTTP 4xx, expression errors, schema failures, size overruns.
    Validation,
    /// Anything else.
    Fatal,
}

impl ErrorCategory {
    /// Only transient and resource failures are worth another attempt.
    pub fn retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Resource)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Resource => write!(f, "RESOURCE"),
            Self::Authorization => write!(f, "AUTHORIZATION"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Validation => write!(f, "VALIDATION"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// A classified step failure.
///
/// This is a value type, not an error hierarchy: handlers construct one at
/// the point of failure and the engine persists it verbatim onto the
/// step execution row (and, on terminal failure, the run).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct StepError {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            category,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retryable(&self) -> bool {
        self.category.retryable()
    }

    /// Classify a failed HTTP response by status code.
    pub fn from_http_status(status: u16, body: Value) -> Self {
        let category = classify_http_status(status);
        Self::new(
            format!("HTTP_{status}"),
            format!("request failed with status {status}"),
            category,
        )
        .with_details(serde_json::json!({ "status": status, "body": body }))
    }

    /// Classify an arbitrary error message.
    ///
    /// Handlers that already produced a [`StepError`] pass it through
    /// untouched; this is the fallback for opaque failures (I/O, client
    /// libraries, panicked conversions) where only the message survives.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        const NETWORK_MARKERS: [&str; 5] = [
            "ECONNREFUSED",
            "ENOTFOUND",
            "ETIMEDOUT",
            "ECONNRESET",
            "socket hang up",
        ];

        if NETWORK_MARKERS.iter().any(|m| message.contains(m)) {
            return Self::new("NETWORK_ERROR", message, ErrorCategory::Transient);
        }
        if message.to_ascii_lowercase().contains("timeout") {
            return Self::new("TIMEOUT", message, ErrorCategory::Transient);
        }
        Self::new("UNKNOWN_ERROR", message, ErrorCategory::Fatal)
    }
}

/// Map an HTTP status code onto a failure category.
///
/// 5xx and 429 are worth retrying; auth and not-found are terminal; every
/// other 4xx is a caller mistake.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        500..=599 | 429 => ErrorCategory::Transient,
        401 | 403 => ErrorCategory::Authorization,
        404 => ErrorCategory::NotFound,
        400..=499 => ErrorCategory::Validation,
        _ => ErrorCategory::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert_eq!(classify_http_status(500), ErrorCategory::Transient);
        assert_eq!(classify_http_status(503), ErrorCategory::Transient);
        assert_eq!(classify_http_status(429), ErrorCategory::Transient);
        assert_eq!(classify_http_status(401), ErrorCategory::Authorization);
        assert_eq!(classify_http_status(403), ErrorCategory::Authorization);
        assert_eq!(classify_http_status(404), ErrorCategory::NotFound);
        for status in [400, 405, 408, 409, 410, 415, 422] {
            assert_eq!(classify_http_status(status), ErrorCategory::Validation);
        }
        assert_eq!(classify_http_status(301), ErrorCategory::Fatal);
        assert_eq!(classify_http_status(200), ErrorCategory::Fatal);
    }

    #[test]
    fn only_transient_and_resource_retry() {
        assert!(ErrorCategory::Transient.retryable());
        assert!(ErrorCategory::Resource.retryable());
        assert!(!ErrorCategory::Authorization.retryable());
        assert!(!ErrorCategory::NotFound.retryable());
        assert!(!ErrorCategory::Validation.retryable());
        assert!(!ErrorCategory::Fatal.retryable());
    }

    #[test]
    fn message_classification() {
        let err = StepError::classify("connect ECONNREFUSED 127.0.0.1:9999");
        assert_eq!(err.code, "NETWORK_ERROR");
        assert!(err.retryable());

        let err = StepError::classify("operation timeout after 30s");
        assert_eq!(err.code, "TIMEOUT");
        assert!(err.retryable());

        let err = StepError::classify("something exploded");
        assert_eq!(err.code, "UNKNOWN_ERROR");
        assert_eq!(err.category, ErrorCategory::Fatal);
        assert!(!err.retryable());
    }

    #[test]
    fn http_error_carries_status_and_body() {
        let err = StepError::from_http_status(404, serde_json::json!({"missing": true}));
        assert_eq!(err.code, "HTTP_404");
        assert_eq!(err.category, ErrorCategory::NotFound);
        let details = err.details.unwrap();
        assert_eq!(details["status"], 404);
        assert_eq!(details["body"]["missing"], true);
    }
}
