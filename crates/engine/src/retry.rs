//! Step retry policy and back-off computation.
//!
//! The engine never sleeps between attempts: a retry is a fresh queue
//! message whose delivery delay is the computed back-off. Jitter spreads
//! simultaneous retries so a burst of failures does not reconverge.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower/upper bound of the uniform jitter factor applied to the base delay.
const JITTER_MIN: f64 = 0.10;
const JITTER_MAX: f64 = 0.20;

/// How the base delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    Fixed,
    Linear,
    Exponential,
}

/// Per-step retry configuration.
///
/// `max_attempts` includes the first try: `max_attempts = 3` means the
/// initial attempt plus up to two retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_type: BackoffType,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_type: BackoffType::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Authoring-time range checks.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=10).contains(&self.max_attempts) {
            return Err(format!(
                "maxAttempts must be within [1, 10], got {}",
                self.max_attempts
            ));
        }
        if !(100..=60_000).contains(&self.initial_delay_ms) {
            return Err(format!(
                "initialDelayMs must be within [100, 60000], got {}",
                self.initial_delay_ms
            ));
        }
        if !(1_000..=3_600_000).contains(&self.max_delay_ms) {
            return Err(format!(
                "maxDelayMs must be within [1000, 3600000], got {}",
                self.max_delay_ms
            ));
        }
        Ok(())
    }
}

/// Compute the delivery delay before retrying after `attempt` failures.
///
/// The base grows per `backoff_type`, a uniform jitter factor in
/// [0.10, 0.20] is applied, and the `max_ms` cap applies after jitter.
pub fn calculate_backoff(
    backoff_type: BackoffType,
    attempt: u32,
    initial_ms: u64,
    max_ms: u64,
) -> Duration {
    let attempt = attempt.max(1);
    let base = match backoff_type {
        BackoffType::Fixed => initial_ms as f64,
        BackoffType::Linear => initial_ms as f64 * attempt as f64,
        BackoffType::Exponential => initial_ms as f64 * 2f64.powi(attempt as i32 - 1),
    };

    let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    let delayed = (base * (1.0 + jitter)).min(max_ms as f64);
    Duration::from_millis(delayed.round() as u64)
}
