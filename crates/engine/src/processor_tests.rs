//! End-to-end tests for the run processor.
//!
//! These drive the real state machine over the in-memory store, queue, and
//! lock manager, with mock handlers standing in for outbound I/O. Time is
//! paused, so delayed delivery and back-off run on the virtual clock and
//! the timing assertions are exact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use handlers::mock::{MockHandler, MockOutcome};
use handlers::transform::TransformHandler;
use handlers::{ErrorCategory, HandlerRegistry, RunContext, StepError, StepHandler, StepType};

use crate::config::Limits;
use crate::lock::{run_lock_key, LockManager};
use crate::models::{RunStatus, StepExecutionStatus, TriggerData};
use crate::processor::RunProcessor;
use crate::queue::{JobMessage, Queue, QueueName};
use crate::retry::{BackoffType, RetryPolicy};
use crate::storage::memory::{MemoryLockManager, MemoryQueue, MemoryStore};
use crate::store::{NewStep, NewStepExecution, NewWorkflow, RunStore};

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    lock: Arc<MemoryLockManager>,
    processor: RunProcessor,
}

fn harness(registry: HandlerRegistry) -> Harness {
    harness_with_limits(registry, Limits::default())
}

fn harness_with_limits(registry: HandlerRegistry, limits: Limits) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let lock = Arc::new(MemoryLockManager::new());
    let processor = RunProcessor::new(
        store.clone(),
        queue.clone(),
        lock.clone(),
        registry,
        limits,
    );
    Harness {
        store,
        queue,
        lock,
        processor,
    }
}

impl Harness {
    /// Process queued messages until both queues drain, honoring delayed
    /// delivery on the virtual clock.
    async fn drain(&self) {
        loop {
            let mut processed = false;
            for name in [QueueName::Execute, QueueName::Ai] {
                while !self.queue.is_empty(name) {
                    let message = self.queue.dequeue(name).await.unwrap();
                    self.processor.handle(name, message).await.unwrap();
                    processed = true;
                }
            }
            if !processed {
                break;
            }
        }
    }

    /// Create a run and its `StartRun` message, like webhook admission does.
    async fn start_run(&self, workflow_id: Uuid) -> Uuid {
        let run = self
            .store
            .create_run(workflow_id, trigger_with_body(json!({})))
            .await
            .unwrap();
        self.queue
            .enqueue(
                QueueName::Execute,
                JobMessage::StartRun {
                    run_id: run.id,
                    workflow_id,
                },
                Duration::ZERO,
            )
            .await
            .unwrap();
        run.id
    }
}

fn trigger_with_body(body: Value) -> TriggerData {
    TriggerData {
        method: "POST".into(),
        headers: HashMap::new(),
        body,
        query: HashMap::new(),
        received_at: chrono::Utc::now(),
        source_ip: None,
    }
}

fn http_step(name: &str) -> NewStep {
    NewStep {
        name: name.into(),
        step_type: StepType::Http,
        config: json!({ "method": "GET", "url": "https://x/echo" }),
        retry_policy: None,
        timeout_ms: None,
        enabled: true,
    }
}

fn registry_with_http(handler: Arc<MockHandler>) -> HandlerRegistry {
    let mut registry: HandlerRegistry = HashMap::new();
    registry.insert(StepType::Http, handler);
    registry.insert(StepType::Transform, Arc::new(TransformHandler));
    registry.insert(StepType::Delay, Arc::new(handlers::delay::DelayHandler));
    registry
}

// ---------------------------------------------------------------------------
// Scenario: linear success
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn linear_run_completes_and_accumulates_context() {
    let fetch = Arc::new(MockHandler::returning(
        json!({ "status": 200, "body": { "value": 7 } }),
    ));
    let h = harness(registry_with_http(fetch.clone()));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "linear".into(),
            slug: "linear".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![
                http_step("fetch"),
                NewStep {
                    name: "transform".into(),
                    step_type: StepType::Transform,
                    config: json!({ "expression": "steps.fetch.body.value", "outputKey": "v" }),
                    retry_policy: None,
                    timeout_ms: None,
                    enabled: true,
                },
            ],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;
    h.drain().await;

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    assert!(run.error.is_none());
    assert_eq!(run.current_step_index, 2);
    assert_eq!(run.context.steps["transform"], json!({ "v": 7 }));

    let executions = h.store.list_step_executions(run_id).await.unwrap();
    assert_eq!(executions.len(), 2);
    for execution in &executions {
        assert_eq!(execution.status, StepExecutionStatus::Completed);
        assert_eq!(execution.attempt, 1);
        // Completed-run invariant: persisted output matches the context.
        assert_eq!(
            execution.output.as_ref().unwrap(),
            &run.context.steps[&execution.step_name]
        );
    }
    assert_eq!(fetch.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: exponential retry then success
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retryable_failures_back_off_then_succeed() {
    let flaky = Arc::new(MockHandler::scripted(vec![
        MockOutcome::transient("HTTP_500", "server error"),
        MockOutcome::transient("HTTP_500", "server error"),
        MockOutcome::Succeed(json!({ "status": 200 })),
    ]));
    let h = harness(registry_with_http(flaky.clone()));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "retry".into(),
            slug: "retry".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![NewStep {
                retry_policy: Some(RetryPolicy {
                    max_attempts: 3,
                    backoff_type: BackoffType::Exponential,
                    initial_delay_ms: 100,
                    max_delay_ms: 10_000,
                }),
                ..http_step("flaky")
            }],
        })
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let run_id = h.start_run(workflow.id).await;
    h.drain().await;
    let elapsed_ms = started.elapsed().as_millis();

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(flaky.call_count(), 3);

    let executions = h.store.list_step_executions(run_id).await.unwrap();
    assert_eq!(executions.len(), 3);
    let by_attempt: Vec<(u32, StepExecutionStatus)> = executions
        .iter()
        .map(|e| (e.attempt, e.status))
        .collect();
    assert_eq!(
        by_attempt,
        vec![
            (1, StepExecutionStatus::Failed),
            (2, StepExecutionStatus::Failed),
            (3, StepExecutionStatus::Completed),
        ]
    );

    // Back-off bounds: 100·(1+j) + 200·(1+j) with j ∈ [0.10, 0.20].
    assert!(
        (330u128..=360u128).contains(&elapsed_ms),
        "total back-off {elapsed_ms}ms outside [330, 360]"
    );
}

// ---------------------------------------------------------------------------
// Scenario: non-retryable failure
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_stops_after_one_attempt() {
    let not_found = Arc::new(MockHandler::failing(StepError::from_http_status(
        404,
        json!({ "error": "no such thing" }),
    )));
    let h = harness(registry_with_http(not_found.clone()));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "missing".into(),
            slug: "missing".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![NewStep {
                retry_policy: Some(RetryPolicy {
                    max_attempts: 5,
                    ..RetryPolicy::default()
                }),
                ..http_step("lookup")
            }],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;
    h.drain().await;

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.code, "HTTP_404");
    assert_eq!(error.step_name.as_deref(), Some("lookup"));

    let executions = h.store.list_step_executions(run_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(
        executions[0].error.as_ref().unwrap().category,
        ErrorCategory::NotFound
    );
    assert_eq!(not_found.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: duplicate delivery tolerated
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stale_duplicate_message_is_ignored() {
    let fetch = Arc::new(MockHandler::returning(json!({ "status": 200 })));
    let h = harness(registry_with_http(fetch.clone()));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "dup".into(),
            slug: "dup".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![http_step("fetch")],
        })
        .await
        .unwrap();
    let step_id = workflow.steps[0].id;

    let run_id = h.start_run(workflow.id).await;
    h.drain().await;
    assert_eq!(
        h.store.get_run(run_id).await.unwrap().status,
        RunStatus::Completed
    );

    // The same ExecuteStep message delivered again, after the index moved on.
    let duplicate = JobMessage::ExecuteStep {
        run_id,
        workflow_id: workflow.id,
        step_index: 0,
        step_id,
        attempt: 1,
    };
    h.processor
        .handle(QueueName::Execute, duplicate)
        .await
        .unwrap();

    let executions = h.store.list_step_executions(run_id).await.unwrap();
    assert_eq!(executions.len(), 1, "duplicate must not add a row");
    assert_eq!(fetch.call_count(), 1);
    assert_eq!(
        h.store.get_run(run_id).await.unwrap().status,
        RunStatus::Completed
    );
}

// ---------------------------------------------------------------------------
// Scenario: delay without worker occupation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn delay_step_defers_the_next_message() {
    let fetch = Arc::new(MockHandler::returning(json!({ "status": 200 })));
    let h = harness(registry_with_http(fetch.clone()));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "delayed".into(),
            slug: "delayed".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![
                NewStep {
                    name: "wait".into(),
                    step_type: StepType::Delay,
                    config: json!({ "durationMs": 5_000 }),
                    retry_policy: None,
                    timeout_ms: None,
                    enabled: true,
                },
                http_step("fetch"),
            ],
        })
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let run_id = h.start_run(workflow.id).await;

    // Process StartRun and the delay step itself; both finish instantly.
    for _ in 0..2 {
        let message = h.queue.dequeue(QueueName::Execute).await.unwrap();
        h.processor
            .handle(QueueName::Execute, message)
            .await
            .unwrap();
    }
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "the delay handler itself must not block a worker"
    );
    // The follow-up message sits in the queue, deferred.
    assert_eq!(h.queue.len(QueueName::Execute), 1);
    assert_eq!(fetch.call_count(), 0);

    h.drain().await;

    assert!(started.elapsed() >= Duration::from_millis(5_000));
    assert_eq!(fetch.call_count(), 1);
    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.context.steps["wait"]["delayMs"], 5_000);
}

// ---------------------------------------------------------------------------
// Guards and limits
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancelled_run_is_not_advanced() {
    let fetch = Arc::new(MockHandler::returning(json!({ "ok": true })));
    let h = harness(registry_with_http(fetch.clone()));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "cancel".into(),
            slug: "cancel".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![http_step("a"), http_step("b")],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;

    // StartRun + first step.
    for _ in 0..2 {
        let message = h.queue.dequeue(QueueName::Execute).await.unwrap();
        h.processor
            .handle(QueueName::Execute, message)
            .await
            .unwrap();
    }
    assert!(h.store.cancel_run(run_id).await.unwrap());

    h.drain().await;

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(fetch.call_count(), 1, "second step must not run");
    assert_eq!(h.store.list_step_executions(run_id).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn contended_lock_requeues_without_touching_state() {
    let fetch = Arc::new(MockHandler::returning(json!({ "ok": true })));
    let h = harness(registry_with_http(fetch.clone()));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "locked".into(),
            slug: "locked".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![http_step("a")],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;
    let start_message = h.queue.dequeue(QueueName::Execute).await.unwrap();
    h.processor
        .handle(QueueName::Execute, start_message)
        .await
        .unwrap();

    // Another worker holds the run.
    let token = h
        .lock
        .acquire(&run_lock_key(run_id), Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let step_message = h.queue.dequeue(QueueName::Execute).await.unwrap();
    h.processor
        .handle(QueueName::Execute, step_message)
        .await
        .unwrap();

    assert_eq!(fetch.call_count(), 0);
    assert_eq!(h.queue.len(QueueName::Execute), 1, "message re-enqueued");
    assert!(h
        .store
        .list_step_executions(run_id)
        .await
        .unwrap()
        .is_empty());

    h.lock.release(&run_lock_key(run_id), &token).await.unwrap();
    h.drain().await;
    assert_eq!(
        h.store.get_run(run_id).await.unwrap().status,
        RunStatus::Completed
    );
}

struct SleepingHandler {
    duration: Duration,
}

#[async_trait::async_trait]
impl StepHandler for SleepingHandler {
    async fn execute(&self, _input: &Value, _ctx: &RunContext) -> Result<Value, StepError> {
        tokio::time::sleep(self.duration).await;
        Ok(json!({ "woke": true }))
    }
}

#[tokio::test(start_paused = true)]
async fn overrunning_step_times_out_as_transient() {
    let mut registry: HandlerRegistry = HashMap::new();
    registry.insert(
        StepType::Http,
        Arc::new(SleepingHandler {
            duration: Duration::from_secs(10),
        }),
    );
    let h = harness(registry);

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "slow".into(),
            slug: "slow".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![NewStep {
                timeout_ms: Some(1_000),
                retry_policy: Some(RetryPolicy {
                    max_attempts: 1,
                    ..RetryPolicy::default()
                }),
                ..http_step("slow")
            }],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;
    h.drain().await;

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.unwrap().code, "TIMEOUT");

    let executions = h.store.list_step_executions(run_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    let error = executions[0].error.as_ref().unwrap();
    assert_eq!(error.category, ErrorCategory::Transient);
}

#[tokio::test(start_paused = true)]
async fn oversized_output_fails_without_retry() {
    let big = Arc::new(MockHandler::returning(json!({ "blob": "x".repeat(512) })));
    let h = harness_with_limits(
        registry_with_http(big.clone()),
        Limits {
            max_step_output_bytes: 128,
            ..Limits::default()
        },
    );

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "big".into(),
            slug: "big".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![http_step("big")],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;
    h.drain().await;

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.unwrap().code, "OUTPUT_TOO_LARGE");
    assert_eq!(big.call_count(), 1, "validation failures never retry");
}

#[tokio::test(start_paused = true)]
async fn oversized_context_fails_the_run() {
    let chunk = Arc::new(MockHandler::returning(json!({ "chunk": "y".repeat(600) })));
    let h = harness_with_limits(
        registry_with_http(chunk.clone()),
        Limits {
            max_step_output_bytes: 4_096,
            max_context_size_bytes: 512,
            ..Limits::default()
        },
    );

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "ctx".into(),
            slug: "ctx".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![http_step("grow")],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;
    h.drain().await;

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.unwrap().code, "CONTEXT_TOO_LARGE");
}

#[tokio::test(start_paused = true)]
async fn run_with_no_enabled_steps_completes_immediately() {
    let h = harness(HashMap::new());
    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "empty".into(),
            slug: "empty".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![NewStep {
                enabled: false,
                ..http_step("off")
            }],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;
    h.drain().await;

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    assert!(h
        .store
        .list_step_executions(run_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn disabled_steps_are_skipped() {
    let fetch = Arc::new(MockHandler::returning(json!({ "ok": true })));
    let h = harness(registry_with_http(fetch.clone()));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "partial".into(),
            slug: "partial".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![
                http_step("first"),
                NewStep {
                    enabled: false,
                    ..http_step("skipped")
                },
                http_step("last"),
            ],
        })
        .await
        .unwrap();

    let run_id = h.start_run(workflow.id).await;
    h.drain().await;

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(fetch.call_count(), 2);
    assert!(run.context.steps.contains_key("first"));
    assert!(run.context.steps.contains_key("last"));
    assert!(!run.context.steps.contains_key("skipped"));
    // Two enabled steps processed, so the index advanced to 2.
    assert_eq!(run.current_step_index, 2);
}

#[tokio::test(start_paused = true)]
async fn retry_messages_survive_an_existing_attempt_row() {
    // A worker that crashed after writing the execution row would leave a
    // (run, step, attempt) row behind; redelivery of the same attempt must
    // surface as a conflict rather than double-writing.
    let fetch = Arc::new(MockHandler::returning(json!({ "ok": true })));
    let h = harness(registry_with_http(fetch));

    let workflow = h
        .store
        .create_workflow(NewWorkflow {
            name: "conflict".into(),
            slug: "conflict".into(),
            webhook_secret: None,
            enabled: true,
            steps: vec![http_step("a")],
        })
        .await
        .unwrap();
    let run_id = h.start_run(workflow.id).await;

    let start = h.queue.dequeue(QueueName::Execute).await.unwrap();
    h.processor.handle(QueueName::Execute, start).await.unwrap();

    // Pre-insert the row the next message will try to create.
    h.store
        .create_step_execution(NewStepExecution {
            run_id,
            step_id: workflow.steps[0].id,
            step_name: "a".into(),
            attempt: 1,
            input: json!({}),
        })
        .await
        .unwrap();

    let step = h.queue.dequeue(QueueName::Execute).await.unwrap();
    let result = h.processor.handle(QueueName::Execute, step).await;
    assert!(result.is_err(), "duplicate attempt row must not be silently overwritten");
}
