pub mod executor;
pub mod types;
pub mod worker;

use tracing::warn;

use crate::delivery::{DeliveryChannel, Notification};
use crate::metrics::counters::Counters;
use crate::task::model::GenerationTask;
use crate::task::repository::TaskRepository;

/// Terminal failure with refund, then the failure notice.
///
/// Returns whether this call performed the refund. The notice goes out only
/// then, so a duplicate finalization never double-notifies.
pub(crate) async fn refund_and_notify(
    tasks: &dyn TaskRepository,
    delivery: &dyn DeliveryChannel,
    counters: &Counters,
    task: &GenerationTask,
    reason: &str,
    now_ms: u64,
) -> anyhow::Result<bool> {
    let Some(refunded_tokens) = tasks.fail_and_refund(&task.task_id, reason, now_ms).await? else {
        return Ok(false);
    };

    Counters::bump(&counters.exec_failed);
    Counters::bump(&counters.refunds);

    let notice = Notification::Failure {
        task_id: task.task_id,
        refunded_tokens,
    };
    if let Err(e) = delivery.notify(task.user_id, &notice).await {
        warn!(error = ?e, task_id = %task.task_id, "failure notice not delivered");
    }

    Ok(true)
}
