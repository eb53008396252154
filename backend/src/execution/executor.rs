//! Task executor: drives one delivered task through its lifecycle.
//!
//! Delivery is at-least-once, so every step is a compare-and-set on the
//! task's status:
//! - only a `pending` task is claimed; anything else is a duplicate
//! - the claim itself is the lock; losing it means another worker has it
//! - the refund rides the terminal status write, so it happens once
//!
//! This module NEVER:
//! - sleeps between attempts (spacing is the queue's job)
//! - touches balances except through `fail_and_refund`

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::delivery::{DeliveryChannel, Notification};
use crate::execution::refund_and_notify;
use crate::execution::types::ExecutionOutcome;
use crate::logger::annotate_span;
use crate::metrics::counters::Counters;
use crate::provider::{ImageProvider, ProviderError, ProviderOutput};
use crate::queue::Delivery;
use crate::task::model::{GenerationTask, TaskId, TaskStatus};
use crate::task::repository::TaskRepository;
use crate::time::now_ms;

pub struct TaskExecutor {
    tasks: Arc<dyn TaskRepository>,
    provider: Arc<dyn ImageProvider>,
    delivery: Arc<dyn DeliveryChannel>,
    /// Provider attempts per task across all deliveries.
    max_attempts: u32,
    provider_timeout: Duration,
    counters: Counters,
}

impl TaskExecutor {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        provider: Arc<dyn ImageProvider>,
        delivery: Arc<dyn DeliveryChannel>,
        max_attempts: u32,
        provider_timeout: Duration,
        counters: Counters,
    ) -> Self {
        Self {
            tasks,
            provider,
            delivery,
            max_attempts: max_attempts.max(1),
            provider_timeout,
            counters,
        }
    }

    #[instrument(
        skip(self, delivery),
        target = "executor",
        fields(task_id = %delivery.task_id, attempt = delivery.attempt)
    )]
    pub async fn handle(&self, delivery: &Delivery) -> anyhow::Result<ExecutionOutcome> {
        let Some(task) = self.tasks.fetch_by_id(&delivery.task_id).await? else {
            warn!("delivered task does not exist");
            return Ok(ExecutionOutcome::Missing);
        };
        annotate_span(task.user_id, Some(&task.task_id));

        if task.status != TaskStatus::Pending {
            Counters::bump(&self.counters.exec_duplicates);
            debug!(status = %task.status, "task already handled");
            return Ok(ExecutionOutcome::AlreadyHandled);
        }

        if !self.tasks.claim(&task.task_id, now_ms()).await? {
            Counters::bump(&self.counters.exec_duplicates);
            debug!("claim lost to a concurrent delivery");
            return Ok(ExecutionOutcome::AlreadyHandled);
        }

        match self.call_provider(&task).await {
            Ok(output) => self.succeed(&task, output).await,
            Err(err) => self.fail_attempt(&task, delivery, err).await,
        }
    }

    /// Error boundary of last resort: fail the task and refund it.
    ///
    /// Returns whether this call performed the refund.
    #[instrument(skip(self, reason), target = "executor")]
    pub async fn compensate(&self, task_id: &TaskId, reason: &str) -> anyhow::Result<bool> {
        let Some(task) = self.tasks.fetch_by_id(task_id).await? else {
            return Ok(false);
        };
        refund_and_notify(
            self.tasks.as_ref(),
            self.delivery.as_ref(),
            &self.counters,
            &task,
            reason,
            now_ms(),
        )
        .await
    }

    async fn call_provider(&self, task: &GenerationTask) -> Result<ProviderOutput, ProviderError> {
        match tokio::time::timeout(
            self.provider_timeout,
            self.provider.execute(task.kind, &task.params),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(ProviderError::Timeout(self.provider_timeout.as_secs())),
        }
    }

    async fn succeed(
        &self,
        task: &GenerationTask,
        output: ProviderOutput,
    ) -> anyhow::Result<ExecutionOutcome> {
        if !self
            .tasks
            .complete(&task.task_id, &output.result_ref, now_ms())
            .await?
        {
            warn!("task left processing before completion; result dropped");
            return Ok(ExecutionOutcome::AlreadyHandled);
        }

        Counters::bump(&self.counters.exec_done);
        info!(result_ref = %output.result_ref, "task done");

        let notice = Notification::Result {
            task_id: task.task_id,
            kind: task.kind,
            prompt: task.params.prompt.clone(),
            result_ref: output.result_ref,
        };
        if let Err(e) = self.delivery.notify(task.user_id, &notice).await {
            warn!(error = ?e, "result not delivered");
        }

        Ok(ExecutionOutcome::Done)
    }

    async fn fail_attempt(
        &self,
        task: &GenerationTask,
        delivery: &Delivery,
        err: ProviderError,
    ) -> anyhow::Result<ExecutionOutcome> {
        let error = err.to_string();
        let is_final =
            task.retry_count.saturating_add(1) >= self.max_attempts || delivery.is_last_attempt();

        warn!(%error, retry_count = task.retry_count, is_final, "provider attempt failed");

        if is_final {
            let refunded = refund_and_notify(
                self.tasks.as_ref(),
                self.delivery.as_ref(),
                &self.counters,
                task,
                &error,
                now_ms(),
            )
            .await?;
            return Ok(ExecutionOutcome::Failed { refunded });
        }

        if !self
            .tasks
            .release_for_retry(&task.task_id, &error, now_ms())
            .await?
        {
            return Ok(ExecutionOutcome::AlreadyHandled);
        }

        Counters::bump(&self.counters.exec_retried);
        Ok(ExecutionOutcome::Retry { error })
    }
}
