/// Result of handling one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Provider succeeded; result stored and delivered.
    Done,
    /// Attempt failed with budget left; task released back to `pending`.
    Retry { error: String },
    /// Final attempt failed. `refunded` is false when another actor had
    /// already finalized the task.
    Failed { refunded: bool },
    /// Task was not `pending` (duplicate or late delivery).
    AlreadyHandled,
    /// No task row for the delivered id.
    Missing,
}

