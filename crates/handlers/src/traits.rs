//! The `StepHandler` trait — the contract every step type must fulfil.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::StepError;

/// The four built-in step types.
///
/// Defined here (in the handlers crate) so both the engine and individual
/// handler implementations can import it without a circular dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Http,
    Transform,
    Ai,
    Delay,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Transform => write!(f, "transform"),
            Self::Ai => write!(f, "ai"),
            Self::Delay => write!(f, "delay"),
        }
    }
}

impl std::str::FromStr for StepType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "transform" => Ok(Self::Transform),
            "ai" => Ok(Self::Ai),
            "delay" => Ok(Self::Delay),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

/// The accumulated execution context a run carries between steps.
///
/// `trigger` is frozen at admission time; `steps` grows by one key (the step
/// name) after each successful step; `variables` is reserved for values set
/// out-of-band. Handlers read the context, the processor extends it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    pub trigger: Value,
    #[serde(default)]
    pub steps: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl RunContext {
    pub fn from_trigger(trigger: Value) -> Self {
        Self {
            trigger,
            steps: Map::new(),
            variables: Map::new(),
        }
    }

    /// Record a completed step's output under its name.
    pub fn insert_step_output(&mut self, step_name: &str, output: Value) {
        self.steps.insert(step_name.to_string(), output);
    }

    /// The context as a single JSON value, the root for expression lookups.
    pub fn as_value(&self) -> Value {
        serde_json::json!({
            "trigger": self.trigger,
            "steps": Value::Object(self.steps.clone()),
            "variables": Value::Object(self.variables.clone()),
        })
    }
}

/// The core handler trait.
///
/// `input` is the step's config with all `{{…}}` placeholders already
/// resolved against the run context; handlers deserialize their own typed
/// config from it and never touch raw templates.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, input: &Value, ctx: &RunContext) -> Result<Value, StepError>;
}

/// Maps step types to handler implementations.
pub type HandlerRegistry = HashMap<StepType, Arc<dyn StepHandler>>;

/// Deployment-level knobs the built-in handlers need.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Base URL of the OpenAI-compatible chat completion endpoint.
    pub llm_base_url: String,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            llm_base_url: "http://localhost:1234".to_string(),
        }
    }
}

/// Build the registry of the four canonical handlers.
pub fn builtin_registry(settings: &HandlerSettings) -> HandlerRegistry {
    let mut registry: HandlerRegistry = HashMap::new();
    registry.insert(StepType::Http, Arc::new(crate::http::HttpHandler::new()));
    registry.insert(StepType::Transform, Arc::new(crate::transform::TransformHandler));
    registry.insert(
        StepType::Ai,
        Arc::new(crate::ai::AiHandler::new(&settings.llm_base_url)),
    );
    registry.insert(StepType::Delay, Arc::new(crate::delay::DelayHandler));
    registry
}
