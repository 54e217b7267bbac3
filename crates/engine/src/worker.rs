//! Queue workers — the only drivers of the run processor.
//!
//! A pool holds a fixed number of worker tasks per queue (`execute` is
//! wider than `ai`; AI calls are assumed heavier), a pump task moving due
//! delayed messages, and a sweeper dropping expired idempotency keys.
//! Shutdown is cooperative via `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::processor::RunProcessor;
use crate::queue::{Queue, QueueName};
use crate::store::RunStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub execute_workers: usize,
    pub ai_workers: usize,
    /// How often due delayed messages are moved to the ready queues.
    pub pump_interval: Duration,
    /// How often expired idempotency keys are swept.
    pub sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            execute_workers: 5,
            ai_workers: 2,
            pump_interval: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(3_600),
        }
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl WorkerPool {
    /// Spawn the worker tasks. They run until [`WorkerPool::shutdown`].
    pub fn spawn(
        processor: Arc<RunProcessor>,
        queue: Arc<dyn Queue>,
        store: Arc<dyn RunStore>,
        config: WorkerConfig,
    ) -> Self {
        let token = CancellationToken::new();
        let mut handles = Vec::new();

        for (queue_name, count) in [
            (QueueName::Execute, config.execute_workers),
            (QueueName::Ai, config.ai_workers),
        ] {
            for worker_index in 0..count {
                handles.push(tokio::spawn(worker_loop(
                    processor.clone(),
                    queue.clone(),
                    queue_name,
                    worker_index,
                    token.child_token(),
                )));
            }
        }

        handles.push(tokio::spawn(pump_loop(
            queue.clone(),
            config.pump_interval,
            token.child_token(),
        )));
        handles.push(tokio::spawn(sweeper_loop(
            store,
            config.sweep_interval,
            token.child_token(),
        )));

        Self { handles, token }
    }

    /// Request a graceful stop and wait for every task to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    processor: Arc<RunProcessor>,
    queue: Arc<dyn Queue>,
    queue_name: QueueName,
    worker_index: usize,
    token: CancellationToken,
) {
    info!(queue = %queue_name, worker_index, "worker started");
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(queue = %queue_name, worker_index, "worker stopped");
                break;
            }
            dequeued = queue.dequeue(queue_name) => match dequeued {
                Ok(message) => {
                    let success = match processor.handle(queue_name, message.clone()).await {
                        Ok(()) => true,
                        Err(e) => {
                            // Infrastructure failure: the broker does not
                            // redeliver (attempts = 1); the run's own retry
                            // machinery is unaffected.
                            error!(run_id = %message.run_id(), "message processing failed: {e}");
                            false
                        }
                    };
                    if let Err(e) = queue.record_outcome(queue_name, &message, success).await {
                        warn!(queue = %queue_name, "failed to record outcome: {e}");
                    }
                }
                Err(e) => {
                    warn!(queue = %queue_name, "dequeue failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

async fn pump_loop(queue: Arc<dyn Queue>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.pump_delayed().await {
                    warn!("delayed-message pump failed: {e}");
                }
            }
        }
    }
}

async fn sweeper_loop(store: Arc<dyn RunStore>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match store.delete_expired_idempotency_keys().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "swept expired idempotency keys"),
                    Err(e) => warn!("idempotency sweep failed: {e}"),
                }
            }
        }
    }
}
