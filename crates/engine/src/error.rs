//! Engine-level error type.
//!
//! These are infrastructure failures (store, queue, lock) that escape the
//! processor; classified *step* failures are [`handlers::StepError`] values
//! and stay inside the run's state machine.

use thiserror::Error;

use crate::lock::LockError;
use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}
