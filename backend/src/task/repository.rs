use anyhow::Result;
use async_trait::async_trait;

use crate::task::model::{GenerationTask, NewTask, TaskId, TaskStatus};
use crate::user::model::UserId;

/// Persistence for generation tasks.
///
/// Status writes are compare-and-set on the expected prior status: `Ok(false)`
/// means another actor moved the task first.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Deducts `tokens_spent` from the owner and inserts the `pending` row in
    /// one transaction. `Ok(None)` when the balance cannot cover the charge;
    /// nothing is written in that case.
    async fn insert_charged(&self, task: &NewTask) -> Result<Option<GenerationTask>>;

    async fn fetch_by_id(&self, task_id: &TaskId) -> Result<Option<GenerationTask>>;

    /// Tasks created by `user_id` at or after `since_ms`.
    async fn count_created_since(&self, user_id: UserId, since_ms: u64) -> Result<u64>;

    /// `pending -> processing`.
    async fn claim(&self, task_id: &TaskId, now_ms: u64) -> Result<bool>;

    /// `processing -> done` and stores the result reference.
    async fn complete(&self, task_id: &TaskId, result_ref: &str, now_ms: u64) -> Result<bool>;

    /// `processing -> pending`, counting one failed attempt.
    async fn release_for_retry(&self, task_id: &TaskId, error: &str, now_ms: u64)
    -> Result<bool>;

    /// Terminal failure plus refund of `tokens_spent`, atomically.
    ///
    /// Returns the refunded amount when this call performed the refund and
    /// `None` when the task was already terminal.
    async fn fail_and_refund(
        &self,
        task_id: &TaskId,
        error: &str,
        now_ms: u64,
    ) -> Result<Option<u64>>;

    /// Non-terminal tasks in `status` last touched before `updated_before_ms`.
    async fn find_stale(
        &self,
        status: TaskStatus,
        updated_before_ms: u64,
        limit: usize,
    ) -> Result<Vec<GenerationTask>>;

    /// Most recent first.
    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<GenerationTask>>;

    /// Sum of `tokens_spent` over the user's tasks that were not refunded.
    async fn outstanding_spend(&self, user_id: UserId) -> Result<u64>;
}
