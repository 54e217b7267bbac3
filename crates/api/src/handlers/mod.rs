pub mod runs;
pub mod webhooks;
pub mod workflows;

pub use crate::AppState;
