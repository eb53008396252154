//! Reconciliation sweep for tasks the queue no longer carries.
//!
//! A task is stranded when it is old, not terminal, and has no `queued` or
//! `leased` job: its enqueue failed after admission committed, or its
//! worker died mid-call and the final lease expired. The sweep either gives
//! it another attempt or fails and refunds it, so no charged token is lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::delivery::DeliveryChannel;
use crate::execution::refund_and_notify;
use crate::metrics::counters::Counters;
use crate::queue::WorkQueue;
use crate::task::model::{GenerationTask, TaskStatus};
use crate::task::repository::TaskRepository;
use crate::time::now_ms;

/// Tasks examined per status per sweep.
const SWEEP_BATCH: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reaped_jobs: u64,
    pub requeued: u64,
    pub refunded: u64,
    /// Stale but still carried by a live job.
    pub still_live: u64,
    pub errors: u64,
}

pub struct Reconciler {
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<dyn WorkQueue>,
    delivery: Arc<dyn DeliveryChannel>,
    max_attempts: u32,
    stale_after: Duration,
    counters: Counters,
}

enum Action {
    Requeued,
    Refunded,
    Nothing,
}

impl Reconciler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<dyn WorkQueue>,
        delivery: Arc<dyn DeliveryChannel>,
        max_attempts: u32,
        stale_after: Duration,
        counters: Counters,
    ) -> Self {
        Self {
            tasks,
            queue,
            delivery,
            max_attempts: max_attempts.max(1),
            stale_after,
            counters,
        }
    }

    #[instrument(skip(self), target = "reconcile")]
    pub async fn sweep(&self, now_ms: u64) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport {
            reaped_jobs: self.queue.reap_expired(now_ms).await?,
            ..Default::default()
        };

        let cutoff = now_ms.saturating_sub(self.stale_after.as_millis() as u64);

        for status in [TaskStatus::Pending, TaskStatus::Processing] {
            let stale = self.tasks.find_stale(status, cutoff, SWEEP_BATCH).await?;

            for task in stale {
                if self.queue.has_live_job(&task.task_id).await? {
                    report.still_live += 1;
                    continue;
                }

                match self.recover(&task, now_ms).await {
                    Ok(Action::Requeued) => report.requeued += 1,
                    Ok(Action::Refunded) => report.refunded += 1,
                    Ok(Action::Nothing) => {}
                    Err(e) => {
                        // one bad task must not stall the sweep
                        report.errors += 1;
                        error!(task_id = %task.task_id, error = ?e, "failed to recover task");
                    }
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(?report, "reconciliation sweep finished");
        }
        Ok(report)
    }

    async fn recover(&self, task: &GenerationTask, now_ms: u64) -> anyhow::Result<Action> {
        match task.status {
            TaskStatus::Pending => {
                if task.retry_count >= self.max_attempts {
                    return self
                        .refund(task, "retry budget exhausted while queued", now_ms)
                        .await;
                }
                self.queue.enqueue(&task.task_id, now_ms).await?;
                Counters::bump(&self.counters.reconcile_requeued);
                warn!(task_id = %task.task_id, "re-enqueued stranded pending task");
                Ok(Action::Requeued)
            }
            TaskStatus::Processing => {
                // The interrupted call counts as a failed attempt.
                const LOST: &str = "worker lost during provider call";

                if task.retry_count.saturating_add(1) >= self.max_attempts {
                    return self.refund(task, LOST, now_ms).await;
                }
                if !self
                    .tasks
                    .release_for_retry(&task.task_id, LOST, now_ms)
                    .await?
                {
                    return Ok(Action::Nothing);
                }
                self.queue.enqueue(&task.task_id, now_ms).await?;
                Counters::bump(&self.counters.reconcile_requeued);
                warn!(task_id = %task.task_id, "released and re-enqueued stranded processing task");
                Ok(Action::Requeued)
            }
            TaskStatus::Done | TaskStatus::Failed => Ok(Action::Nothing),
        }
    }

    async fn refund(
        &self,
        task: &GenerationTask,
        reason: &str,
        now_ms: u64,
    ) -> anyhow::Result<Action> {
        let refunded = refund_and_notify(
            self.tasks.as_ref(),
            self.delivery.as_ref(),
            &self.counters,
            task,
            reason,
            now_ms,
        )
        .await?;

        Ok(if refunded {
            Action::Refunded
        } else {
            Action::Nothing
        })
    }

    /// Sweeps every `interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(now_ms()).await {
                        error!(error = ?e, "reconciliation sweep failed");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
