//! Queue consumers.
//!
//! Each `ExecutorWorker` leases one job at a time, hands it to the shared
//! `TaskExecutor` and settles the job from the outcome. The pool is N such
//! workers over the same queue.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, warn};

use crate::execution::executor::TaskExecutor;
use crate::execution::types::ExecutionOutcome;
use crate::logger::{TraceId, root_span};
use crate::metrics::counters::Counters;
use crate::queue::{Delivery, RetryDecision, WorkQueue};
use crate::time::now_ms;

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub lease: Duration,
    pub poll_interval: Duration,
}

pub struct ExecutorWorker {
    id: usize,
    queue: Arc<dyn WorkQueue>,
    executor: Arc<TaskExecutor>,
    settings: WorkerSettings,
    counters: Counters,
}

impl ExecutorWorker {
    pub fn new(
        id: usize,
        queue: Arc<dyn WorkQueue>,
        executor: Arc<TaskExecutor>,
        settings: WorkerSettings,
        counters: Counters,
    ) -> Self {
        Self {
            id,
            queue,
            executor,
            settings,
            counters,
        }
    }

    /// Worker loop.
    ///
    /// Runs until `shutdown` flips to true, or, in `burst` mode, until the
    /// queue has nothing runnable. Never panics on job errors.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, burst: bool) {
        info!(component = "worker", worker = self.id, burst, event = "startup");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(worked) => !worked,
                Err(e) => {
                    error!(worker = self.id, error = ?e, "queue poll failed");
                    true
                }
            };

            if !idle {
                continue;
            }
            if burst {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        info!(component = "worker", worker = self.id, "Worker exiting");
    }

    /// Leases and processes at most one job. `Ok(false)` when idle.
    pub async fn poll_once(&self) -> anyhow::Result<bool> {
        let lease_ms = self.settings.lease.as_millis() as u64;
        let Some(delivery) = self.queue.lease(now_ms(), lease_ms).await? else {
            return Ok(false);
        };

        let span = root_span("delivery", &TraceId::generate());
        self.process(delivery).instrument(span).await?;
        Ok(true)
    }

    async fn process(&self, delivery: Delivery) -> anyhow::Result<()> {
        match self.executor.handle(&delivery).await {
            Ok(ExecutionOutcome::Retry { error }) => self.reschedule(&delivery, &error).await,
            Ok(outcome) => {
                debug!(?outcome, "settling job");
                self.queue.ack(&delivery.job_id).await
            }
            Err(e) => {
                Counters::bump(&self.counters.exec_errors);
                let reason = format!("{e:#}");
                error!(error = %reason, attempt = delivery.attempt, "task handling failed");

                if delivery.is_last_attempt() {
                    self.executor.compensate(&delivery.task_id, &reason).await?;
                    self.queue.ack(&delivery.job_id).await
                } else {
                    self.reschedule(&delivery, &reason).await
                }
            }
        }
    }

    async fn reschedule(&self, delivery: &Delivery, error: &str) -> anyhow::Result<()> {
        match self.queue.retry(&delivery.job_id, error, now_ms()).await? {
            RetryDecision::Scheduled { run_at_ms } => {
                debug!(run_at_ms, "retry scheduled");
            }
            RetryDecision::Exhausted => {
                // Reconciliation picks up whatever state the task is left in.
                warn!("job exhausted while task still open");
            }
        }
        Ok(())
    }
}

/// N workers over one queue.
pub struct WorkerPool {
    workers: Vec<ExecutorWorker>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        queue: Arc<dyn WorkQueue>,
        executor: Arc<TaskExecutor>,
        settings: WorkerSettings,
        counters: Counters,
    ) -> Self {
        let workers = (0..size.max(1))
            .map(|id| {
                ExecutorWorker::new(
                    id,
                    queue.clone(),
                    executor.clone(),
                    settings.clone(),
                    counters.clone(),
                )
            })
            .collect();
        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Runs every worker to completion.
    pub async fn run(self, shutdown: watch::Receiver<bool>, burst: bool) {
        let handles = self
            .workers
            .into_iter()
            .map(|w| tokio::spawn(w.run(shutdown.clone(), burst)));

        for res in join_all(handles).await {
            if let Err(e) = res {
                error!(error = ?e, "worker task aborted");
            }
        }
    }
}
