//! Replication Task Ingest
//!
//! Worker pool draining the inbound task queue. Each task is applied
//! under its own deadline; retryable failures are retried with
//! exponential backoff and jitter, everything else is dead-lettered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::task::ReplicationTask;
use crate::config::ReconcilerConfig;
use crate::context::with_deadline;
use crate::ndc::{ApplyOutcome, HistoryReplicator};

/// Worker pool tuning
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub reconcile_timeout: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self {
            workers: config.replication.workers,
            max_attempts: config.replication.max_attempts,
            retry_backoff: Duration::from_millis(config.replication.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(config.replication.max_retry_backoff_ms),
            reconcile_timeout: config.reconcile_timeout(),
        }
    }
}

/// A task that will not be retried
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub task: ReplicationTask,
    pub error: String,
    pub error_kind: &'static str,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Dead-lettered tasks, kept for operators
#[derive(Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetter>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, letter: DeadLetter) {
        self.entries().push(letter);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries().clone()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.entries())
    }
}

/// Applies queued tasks with a bounded number of workers
pub struct TaskProcessor {
    replicator: Arc<HistoryReplicator>,
    settings: IngestSettings,
    dead_letters: Arc<DeadLetterQueue>,
}

impl TaskProcessor {
    pub fn new(
        replicator: Arc<HistoryReplicator>,
        settings: IngestSettings,
        dead_letters: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            replicator,
            settings,
            dead_letters,
        }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Drain `tasks` until the queue closes or `shutdown` fires. Tasks in
    /// flight at shutdown are cancelled; their leases are released.
    pub async fn run(&self, tasks: mpsc::Receiver<ReplicationTask>, shutdown: CancellationToken) {
        tracing::info!("Task processor started with {} workers", self.settings.workers);

        ReceiverStream::new(tasks)
            .take_until(shutdown.cancelled())
            .for_each_concurrent(self.settings.workers.max(1), |task| {
                let shutdown = shutdown.clone();
                async move {
                    self.process(&shutdown, task).await;
                }
            })
            .await;

        tracing::info!("Task processor stopped");
    }

    /// Apply one task, retrying as allowed. `None` if it was
    /// dead-lettered or abandoned on shutdown.
    pub async fn process(
        &self,
        shutdown: &CancellationToken,
        task: ReplicationTask,
    ) -> Option<ApplyOutcome> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let (ctx, _deadline) = with_deadline(shutdown, self.settings.reconcile_timeout);

            let error = match self.replicator.apply(&ctx, &task).await {
                Ok(outcome) => {
                    tracing::debug!(
                        "Task {} for {} applied: {:?}",
                        task.task_id,
                        task.run_key,
                        outcome
                    );
                    return Some(outcome);
                }
                Err(e) => e,
            };

            if shutdown.is_cancelled() {
                tracing::info!("Task {} for {} abandoned on shutdown", task.task_id, task.run_key);
                return None;
            }

            if error.is_retryable() && attempts < self.settings.max_attempts {
                let delay = self.backoff(attempts);
                tracing::warn!(
                    "Task {} for {} failed (attempt {}): {}; retrying in {:?}",
                    task.task_id,
                    task.run_key,
                    attempts,
                    error,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = shutdown.cancelled() => return None,
                }
            }

            if error.is_protocol_fatal() {
                tracing::error!(
                    "Task {} for {} rejected: {}",
                    task.task_id,
                    task.run_key,
                    error
                );
            } else {
                tracing::warn!(
                    "Task {} for {} dead-lettered after {} attempts: {}",
                    task.task_id,
                    task.run_key,
                    attempts,
                    error
                );
            }
            self.dead_letters.push(DeadLetter {
                task,
                error: error.to_string(),
                error_kind: error.kind(),
                attempts,
                at: Utc::now(),
            });
            return None;
        }
    }

    /// Exponential backoff with up to 50% jitter
    fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let base = self
            .settings
            .retry_backoff
            .saturating_mul(1 << exponent)
            .min(self.settings.max_retry_backoff);
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(jitter)
    }
}
