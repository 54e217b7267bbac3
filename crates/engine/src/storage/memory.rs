//! In-memory queue, lock manager, and store.
//!
//! First-class backends, not test shims: they implement the same traits as
//! the Redis/Postgres implementations and honor the same semantics (delayed
//! delivery, lease expiry, conditional status transitions, uniqueness), so
//! the full engine runs in a single process with no infrastructure. The
//! test suite and local development both run on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::lock::{LockError, LockManager};
use crate::models::{
    Run, RunError, RunStatus, Step, StepExecution, StepExecutionStatus, TriggerData, Workflow,
};
use crate::queue::{
    JobMessage, Queue, QueueError, QueueName, COMPLETED_RETENTION, FAILED_RETENTION,
};
use crate::store::{
    NewStep, NewStepExecution, NewWorkflow, RunStore, StoreError, IDEMPOTENCY_TTL_HOURS,
};
use handlers::{RunContext, StepError};

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

struct QueuedItem {
    ready_at: Instant,
    seq: u64,
    message: JobMessage,
}

#[derive(Default)]
struct QueueState {
    items: Vec<QueuedItem>,
}

/// Two named FIFO queues with virtual-time delayed delivery.
pub struct MemoryQueue {
    execute: Mutex<QueueState>,
    ai: Mutex<QueueState>,
    execute_notify: Notify,
    ai_notify: Notify,
    seq: AtomicU64,
    outcomes: Mutex<Outcomes>,
}

#[derive(Default)]
struct Outcomes {
    completed: Vec<JobMessage>,
    failed: Vec<JobMessage>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            execute: Mutex::new(QueueState::default()),
            ai: Mutex::new(QueueState::default()),
            execute_notify: Notify::new(),
            ai_notify: Notify::new(),
            seq: AtomicU64::new(0),
            outcomes: Mutex::new(Outcomes::default()),
        }
    }

    fn state(&self, queue: QueueName) -> &Mutex<QueueState> {
        match queue {
            QueueName::Execute => &self.execute,
            QueueName::Ai => &self.ai,
        }
    }

    fn notify(&self, queue: QueueName) -> &Notify {
        match queue {
            QueueName::Execute => &self.execute_notify,
            QueueName::Ai => &self.ai_notify,
        }
    }

    /// Messages currently sitting in the queue (ready or delayed).
    pub fn len(&self, queue: QueueName) -> usize {
        self.state(queue).lock().unwrap().items.len()
    }

    pub fn is_empty(&self, queue: QueueName) -> bool {
        self.len(queue) == 0
    }

    pub fn completed_count(&self) -> usize {
        self.outcomes.lock().unwrap().completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.lock().unwrap().failed.len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        message: JobMessage,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let item = QueuedItem {
            ready_at: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            message,
        };
        self.state(queue).lock().unwrap().items.push(item);
        self.notify(queue).notify_one();
        Ok(())
    }

    async fn dequeue(&self, queue: QueueName) -> Result<JobMessage, QueueError> {
        loop {
            let notified = self.notify(queue).notified();

            let earliest = {
                let mut state = self.state(queue).lock().unwrap();
                let now = Instant::now();
                let ready = state
                    .items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| item.ready_at <= now)
                    .min_by_key(|(_, item)| (item.ready_at, item.seq))
                    .map(|(idx, _)| idx);

                if let Some(idx) = ready {
                    return Ok(state.items.remove(idx).message);
                }
                state.items.iter().map(|item| item.ready_at).min()
            };

            match earliest {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn record_outcome(
        &self,
        _queue: QueueName,
        message: &JobMessage,
        success: bool,
    ) -> Result<(), QueueError> {
        let mut outcomes = self.outcomes.lock().unwrap();
        let (list, cap) = if success {
            (&mut outcomes.completed, COMPLETED_RETENTION)
        } else {
            (&mut outcomes.failed, FAILED_RETENTION)
        };
        list.push(message.clone());
        if list.len() > cap {
            let excess = list.len() - cap;
            list.drain(..excess);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryLockManager
// ---------------------------------------------------------------------------

/// Lease table keyed by lock key; expired leases are reclaimable.
#[derive(Default)]
pub struct MemoryLockManager {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>, LockError> {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();
        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(key) {
            Some((held, expires_at)) if held == token => {
                *expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut leases = self.leases.lock().unwrap();
        if matches!(leases.get(key), Some((held, _)) if held == token) {
            leases.remove(key);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStoreInner {
    workflows: HashMap<Uuid, Workflow>,
    runs: HashMap<Uuid, Run>,
    executions: Vec<StepExecution>,
    idempotency: HashMap<String, (Uuid, chrono::DateTime<Utc>)>,
}

/// Hash-map-backed [`RunStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ordered_steps(mut steps: Vec<Step>) -> Vec<Step> {
    steps.sort_by_key(|s| s.order);
    steps
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_workflow(&self, new: NewWorkflow) -> Result<Workflow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.workflows.values().any(|w| w.slug == new.slug) {
            return Err(StoreError::Conflict(format!(
                "slug '{}' already exists",
                new.slug
            )));
        }

        let mut names = std::collections::HashSet::new();
        for step in &new.steps {
            if !names.insert(step.name.as_str()) {
                return Err(StoreError::Conflict(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        let workflow_id = Uuid::new_v4();
        let now = Utc::now();
        let steps = new
            .steps
            .into_iter()
            .enumerate()
            .map(|(order, step)| Step {
                id: Uuid::new_v4(),
                workflow_id,
                order: order as i32,
                name: step.name,
                step_type: step.step_type,
                config: step.config,
                retry_policy: step.retry_policy,
                timeout_ms: step.timeout_ms,
                enabled: step.enabled,
            })
            .collect();

        let workflow = Workflow {
            id: workflow_id,
            name: new.name,
            slug: new.slug,
            webhook_secret: new.webhook_secret,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
            steps,
        };
        inner.workflows.insert(workflow_id, workflow.clone());
        Ok(workflow)
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut workflows: Vec<Workflow> = inner.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut workflow = inner.workflows.get(&id).cloned().ok_or(StoreError::NotFound)?;
        workflow.steps = ordered_steps(workflow.steps);
        Ok(workflow)
    }

    async fn find_workflow_by_slug(&self, slug: &str) -> Result<Option<Workflow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .workflows
            .values()
            .find(|w| w.slug == slug)
            .cloned()
            .map(|mut w| {
                w.steps = ordered_steps(w.steps);
                w
            }))
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.workflows.remove(&id).ok_or(StoreError::NotFound)?;
        Ok(())
    }

    async fn create_step(&self, workflow_id: Uuid, new: NewStep) -> Result<Step, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound)?;

        if workflow.steps.iter().any(|s| s.name == new.name) {
            return Err(StoreError::Conflict(format!(
                "duplicate step name '{}'",
                new.name
            )));
        }

        let step = Step {
            id: Uuid::new_v4(),
            workflow_id,
            order: workflow.steps.len() as i32,
            name: new.name,
            step_type: new.step_type,
            config: new.config,
            retry_policy: new.retry_policy,
            timeout_ms: new.timeout_ms,
            enabled: new.enabled,
        };
        workflow.steps.push(step.clone());
        workflow.updated_at = Utc::now();
        Ok(step)
    }

    async fn delete_step(&self, workflow_id: Uuid, step_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound)?;

        let before = workflow.steps.len();
        workflow.steps.retain(|s| s.id != step_id);
        if workflow.steps.len() == before {
            return Err(StoreError::NotFound);
        }

        // Re-densify surviving orders to [0..n).
        workflow.steps.sort_by_key(|s| s.order);
        for (order, step) in workflow.steps.iter_mut().enumerate() {
            step.order = order as i32;
        }
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn create_run(
        &self,
        workflow_id: Uuid,
        trigger: TriggerData,
    ) -> Result<Run, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound);
        }
        let run = Run {
            id: Uuid::new_v4(),
            workflow_id,
            status: RunStatus::Pending,
            context: trigger.initial_context(),
            trigger_data: trigger,
            current_step_index: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner.runs.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list_runs(&self, workflow_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn mark_run_running(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
        }
        Ok(())
    }

    async fn advance_run(
        &self,
        id: Uuid,
        current_step_index: u32,
        context: &RunContext,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&id).ok_or(StoreError::NotFound)?;
        run.current_step_index = current_step_index;
        run.context = context.clone();
        Ok(())
    }

    async fn complete_run(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if run.status == RunStatus::Running {
            run.status = RunStatus::Completed;
            run.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail_run(&self, id: Uuid, error: &RunError) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if run.status == RunStatus::Running {
            run.status = RunStatus::Failed;
            run.completed_at = Some(Utc::now());
            run.error = Some(error.clone());
        }
        Ok(())
    }

    async fn cancel_run(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if matches!(run.status, RunStatus::Pending | RunStatus::Running) {
            run.status = RunStatus::Cancelled;
            run.completed_at = Some(Utc::now());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn create_step_execution(
        &self,
        new: NewStepExecution,
    ) -> Result<StepExecution, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner.executions.iter().any(|e| {
            e.run_id == new.run_id && e.step_id == new.step_id && e.attempt == new.attempt
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "execution already exists for run {} step {} attempt {}",
                new.run_id, new.step_id, new.attempt
            )));
        }

        let execution = StepExecution {
            id: Uuid::new_v4(),
            run_id: new.run_id,
            step_id: new.step_id,
            step_name: new.step_name,
            status: StepExecutionStatus::Pending,
            attempt: new.attempt,
            input: new.input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        inner.executions.push(execution.clone());
        Ok(execution)
    }

    async fn mark_step_execution_running(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound)?;
        execution.status = StepExecutionStatus::Running;
        Ok(())
    }

    async fn complete_step_execution(
        &self,
        id: Uuid,
        output: &Value,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound)?;
        execution.status = StepExecutionStatus::Completed;
        execution.output = Some(output.clone());
        execution.completed_at = Some(Utc::now());
        execution.duration_ms = Some(duration_ms);
        Ok(())
    }

    async fn fail_step_execution(
        &self,
        id: Uuid,
        error: &StepError,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound)?;
        execution.status = StepExecutionStatus::Failed;
        execution.error = Some(error.clone());
        execution.completed_at = Some(Utc::now());
        execution.duration_ms = Some(duration_ms);
        Ok(())
    }

    async fn list_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut executions: Vec<StepExecution> = inner
            .executions
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(executions)
    }

    async fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .idempotency
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(run_id, _)| *run_id))
    }

    async fn bind_idempotency_key(&self, key: &str, run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let entry = inner.idempotency.entry(key.to_string());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                // Insert-if-absent; an expired binding can be replaced.
                if slot.get().1 <= now {
                    slot.insert((run_id, now + ChronoDuration::hours(IDEMPOTENCY_TTL_HOURS)));
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert((run_id, now + ChronoDuration::hours(IDEMPOTENCY_TTL_HOURS)));
            }
        }
        Ok(())
    }

    async fn delete_expired_idempotency_keys(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - inner.idempotency.len()) as u64)
    }
}
