//! `handlers` crate — the `StepHandler` trait and built-in step implementations.
//!
//! Every step type — built-in and future plugins alike — must implement
//! [`StepHandler`]. The engine crate dispatches execution through this trait
//! object and never knows what a step does internally.

pub mod ai;
pub mod delay;
pub mod error;
pub mod expression;
pub mod http;
pub mod mock;
pub mod traits;
pub mod transform;

pub use error::{classify_http_status, ErrorCategory, StepError};
pub use traits::{
    builtin_registry, HandlerRegistry, HandlerSettings, RunContext, StepHandler, StepType,
};
