//! The run processor — the state machine that advances a run step by step.
//!
//! Two idempotent entry points, both invoked by queue workers:
//! [`RunProcessor::handle`] dispatches `StartRun` and `ExecuteStep`
//! messages. Per-run mutual exclusion comes from the run lock; duplicate
//! and stale deliveries are rejected by the `(status, current_step_index,
//! step_id)` guards before they can touch state. Delays and retries are
//! never slept in-process: both are expressed as the delivery delay of the
//! next queue message, so a waiting run occupies no worker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use handlers::expression::resolve_expressions;
use handlers::{ErrorCategory, HandlerRegistry, StepError, StepHandler, StepType};

use crate::config::Limits;
use crate::error::EngineError;
use crate::lock::{run_lock_key, LockManager};
use crate::models::{RunError, RunStatus, Step};
use crate::queue::{JobMessage, Queue, QueueName};
use crate::retry::calculate_backoff;
use crate::store::{NewStepExecution, RunStore};

/// Slack added on top of a step's effective timeout when the lock lease
/// must outlive the default TTL.
const LOCK_TTL_MARGIN: Duration = Duration::from_secs(10);

pub struct RunProcessor {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn Queue>,
    lock: Arc<dyn LockManager>,
    registry: HandlerRegistry,
    limits: Limits,
}

impl RunProcessor {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn Queue>,
        lock: Arc<dyn LockManager>,
        registry: HandlerRegistry,
        limits: Limits,
    ) -> Self {
        Self {
            store,
            queue,
            lock,
            registry,
            limits,
        }
    }

    /// Process one dequeued message. `queue` is the queue it arrived on,
    /// needed to re-enqueue verbatim on lock contention.
    pub async fn handle(&self, queue: QueueName, message: JobMessage) -> Result<(), EngineError> {
        match message {
            JobMessage::StartRun {
                run_id,
                workflow_id,
            } => self.on_start_run(run_id, workflow_id).await,
            JobMessage::ExecuteStep { .. } => self.on_execute_step(queue, message).await,
            JobMessage::CompleteRun { run_id, status } => {
                // Reserved message type; state transitions happen inline.
                tracing::debug!(%run_id, %status, "ignoring complete_run message");
                Ok(())
            }
        }
    }

    #[instrument(skip(self), fields(run_id = %run_id, workflow_id = %workflow_id))]
    async fn on_start_run(&self, run_id: Uuid, workflow_id: Uuid) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        self.store.get_run(run_id).await?;
        self.store.mark_run_running(run_id).await?;

        let enabled = workflow.enabled_steps();
        let Some(first) = enabled.first() else {
            self.store.complete_run(run_id).await?;
            info!("run completed: no enabled steps");
            return Ok(());
        };

        self.queue
            .enqueue(
                QueueName::for_step(first.step_type),
                JobMessage::ExecuteStep {
                    run_id,
                    workflow_id,
                    step_index: 0,
                    step_id: first.id,
                    attempt: 1,
                },
                Duration::ZERO,
            )
            .await?;
        Ok(())
    }

    async fn on_execute_step(
        &self,
        queue: QueueName,
        message: JobMessage,
    ) -> Result<(), EngineError> {
        let run_id = message.run_id();
        let key = run_lock_key(run_id);

        let Some(token) = self.lock.acquire(&key, self.limits.lock_ttl).await? else {
            // Another worker holds the run; come back shortly. The requeue
            // cycle is unbounded, so surface each pass for operators.
            warn!(%run_id, "lock_contention: re-enqueueing step message");
            self.queue
                .enqueue(queue, message, self.limits.lock_retry_delay)
                .await?;
            return Ok(());
        };

        let result = self.execute_step_locked(&key, &token, message).await;

        if let Err(e) = self.lock.release(&key, &token).await {
            warn!(%run_id, "failed to release run lock: {e}");
        }
        result
    }

    #[instrument(
        skip_all,
        fields(
            run_id = tracing::field::Empty,
            step_index = tracing::field::Empty,
            attempt = tracing::field::Empty
        )
    )]
    async fn execute_step_locked(
        &self,
        lock_key: &str,
        lock_token: &str,
        message: JobMessage,
    ) -> Result<(), EngineError> {
        let JobMessage::ExecuteStep {
            run_id,
            workflow_id,
            step_index,
            step_id,
            attempt,
        } = message
        else {
            return Ok(());
        };
        tracing::Span::current()
            .record("run_id", tracing::field::display(run_id))
            .record("step_index", step_index)
            .record("attempt", attempt);

        let workflow = self.store.get_workflow(workflow_id).await?;
        let run = self.store.get_run(run_id).await?;

        if run.status != RunStatus::Running {
            // Cancelled or already terminal; drop silently.
            info!(status = %run.status, "skipping step for non-running run");
            return Ok(());
        }
        if run.current_step_index != step_index {
            // A stale duplicate of an already-processed message.
            info!(
                current = run.current_step_index,
                "skipping stale step message"
            );
            return Ok(());
        }

        let enabled = workflow.enabled_steps();
        let Some(step) = enabled.iter().find(|s| s.id == step_id).map(|s| (*s).clone()) else {
            let run_error = RunError {
                code: "STEP_NOT_FOUND".to_string(),
                message: format!("step {step_id} is not among the workflow's enabled steps"),
                details: None,
                step_id: Some(step_id),
                step_name: None,
            };
            error!(%step_id, "failing run: step not found");
            self.store.fail_run(run_id, &run_error).await?;
            return Ok(());
        };

        let Some(handler) = self.registry.get(&step.step_type) else {
            let run_error = RunError {
                code: "HANDLER_NOT_FOUND".to_string(),
                message: format!("no handler registered for step type '{}'", step.step_type),
                details: None,
                step_id: Some(step.id),
                step_name: Some(step.name.clone()),
            };
            error!(step_type = %step.step_type, "failing run: handler not found");
            self.store.fail_run(run_id, &run_error).await?;
            return Ok(());
        };

        let resolved_input = resolve_expressions(&step.config, &run.context);

        let execution = self
            .store
            .create_step_execution(NewStepExecution {
                run_id,
                step_id: step.id,
                step_name: step.name.clone(),
                attempt,
                input: resolved_input.clone(),
            })
            .await?;
        self.store.mark_step_execution_running(execution.id).await?;

        let effective_timeout = Duration::from_millis(
            step.timeout_ms
                .unwrap_or(self.limits.default_step_timeout_ms)
                .min(self.limits.max_step_timeout_ms),
        );

        // A long-running step must not outlive the lease.
        if effective_timeout + LOCK_TTL_MARGIN > self.limits.lock_ttl {
            match self
                .lock
                .extend(lock_key, lock_token, effective_timeout + LOCK_TTL_MARGIN)
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!(%run_id, "lock lease vanished before extension"),
                Err(e) => warn!(%run_id, "failed to extend lock lease: {e}"),
            }
        }

        let started = tokio::time::Instant::now();
        let outcome = match tokio::time::timeout(
            effective_timeout,
            handler.execute(&resolved_input, &run.context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StepError::new(
                "TIMEOUT",
                format!(
                    "step '{}' timed out after {}ms",
                    step.name,
                    effective_timeout.as_millis()
                ),
                ErrorCategory::Transient,
            )),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = outcome.and_then(|output| {
            let size = json_size(&output);
            if size > self.limits.max_step_output_bytes {
                Err(StepError::new(
                    "OUTPUT_TOO_LARGE",
                    format!(
                        "step output is {size} bytes, exceeding the {} byte limit",
                        self.limits.max_step_output_bytes
                    ),
                    ErrorCategory::Validation,
                ))
            } else {
                Ok(output)
            }
        });

        let output = match outcome {
            Ok(output) => output,
            Err(step_error) => {
                return self
                    .handle_step_failure(
                        run_id,
                        workflow_id,
                        &step,
                        step_index,
                        attempt,
                        execution.id,
                        duration_ms,
                        step_error,
                    )
                    .await;
            }
        };

        self.store
            .complete_step_execution(execution.id, &output, duration_ms)
            .await?;

        let mut new_context = run.context.clone();
        new_context.insert_step_output(&step.name, output);

        let context_size = serde_json::to_vec(&new_context).map(|b| b.len()).unwrap_or(0);
        if context_size > self.limits.max_context_size_bytes {
            let step_error = StepError::new(
                "CONTEXT_TOO_LARGE",
                format!(
                    "run context grew to {context_size} bytes, exceeding the {} byte limit",
                    self.limits.max_context_size_bytes
                ),
                ErrorCategory::Validation,
            );
            return self
                .handle_step_failure(
                    run_id,
                    workflow_id,
                    &step,
                    step_index,
                    attempt,
                    execution.id,
                    duration_ms,
                    step_error,
                )
                .await;
        }

        let next_index = step_index + 1;
        self.store
            .advance_run(run_id, next_index, &new_context)
            .await?;

        if let Some(next_step) = enabled.get(next_index as usize) {
            // A completed delay step defers the *next* message instead of
            // having occupied a worker.
            let delay = if step.step_type == StepType::Delay {
                resolved_input
                    .get("durationMs")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::ZERO)
            } else {
                Duration::ZERO
            };

            self.queue
                .enqueue(
                    QueueName::for_step(next_step.step_type),
                    JobMessage::ExecuteStep {
                        run_id,
                        workflow_id,
                        step_index: next_index,
                        step_id: next_step.id,
                        attempt: 1,
                    },
                    delay,
                )
                .await?;
            info!(step = %step.name, next = %next_step.name, "step completed");
        } else {
            self.store.complete_run(run_id).await?;
            info!(step = %step.name, "run completed");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_step_failure(
        &self,
        run_id: Uuid,
        workflow_id: Uuid,
        step: &Step,
        step_index: u32,
        attempt: u32,
        execution_id: Uuid,
        duration_ms: u64,
        step_error: StepError,
    ) -> Result<(), EngineError> {
        self.store
            .fail_step_execution(execution_id, &step_error, duration_ms)
            .await?;

        let policy = step.retry_policy.unwrap_or_default();
        if step_error.retryable() && attempt < policy.max_attempts {
            let delay = calculate_backoff(
                policy.backoff_type,
                attempt,
                policy.initial_delay_ms,
                policy.max_delay_ms,
            );
            warn!(
                step = %step.name,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                code = %step_error.code,
                "step failed, retrying"
            );
            self.queue
                .enqueue(
                    QueueName::for_step(step.step_type),
                    JobMessage::ExecuteStep {
                        run_id,
                        workflow_id,
                        step_index,
                        step_id: step.id,
                        attempt: attempt + 1,
                    },
                    delay,
                )
                .await?;
        } else {
            let run_error = RunError {
                code: step_error.code.clone(),
                message: step_error.message.clone(),
                details: step_error.details.clone(),
                step_id: Some(step.id),
                step_name: Some(step.name.clone()),
            };
            error!(
                step = %step.name,
                attempt,
                code = %step_error.code,
                retryable = step_error.retryable(),
                "step failed terminally, failing run"
            );
            self.store.fail_run(run_id, &run_error).await?;
        }
        Ok(())
    }
}

fn json_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
}
