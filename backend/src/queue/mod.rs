//! Durable work queue carrying task ids to executor workers.
//!
//! Delivery is at-least-once: a job whose lease expires before it is acked
//! is handed out again. Retry spacing is owned here, not by the executor.

pub mod queue_sqlx;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::task::model::TaskId;

pub type JobId = Uuid;

/// Attempts per job and the fixed delays between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows failed attempt `attempt` (1-based).
    /// The last entry repeats once the schedule runs out.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// When to run next, or `None` once `attempt` used up the budget.
    pub fn next_run_at_ms(&self, failed_at_ms: u64, attempt: u32) -> Option<u64> {
        if attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay_after(attempt).as_millis() as u64;
        Some(failed_at_ms.saturating_add(delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Leased,
    Done,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Done => "done",
            JobStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "leased" => Ok(JobStatus::Leased),
            "done" => Ok(JobStatus::Done),
            "dead" => Ok(JobStatus::Dead),
            other => Err(anyhow::anyhow!("Invalid JobStatus value: {}", other)),
        }
    }
}

/// One leased job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub task_id: TaskId,
    /// 1-based; already counts this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Delivery {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { run_at_ms: u64 },
    Exhausted,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, task_id: &TaskId, now_ms: u64) -> anyhow::Result<JobId>;

    /// Claims the oldest runnable job for `lease_ms`. `None` when idle.
    async fn lease(&self, now_ms: u64, lease_ms: u64) -> anyhow::Result<Option<Delivery>>;

    async fn ack(&self, job_id: &JobId) -> anyhow::Result<()>;

    /// Schedules the next attempt after a failure, or buries the job.
    async fn retry(&self, job_id: &JobId, error: &str, now_ms: u64)
    -> anyhow::Result<RetryDecision>;

    /// Buries expired leases that have no attempts left. Returns how many.
    async fn reap_expired(&self, now_ms: u64) -> anyhow::Result<u64>;

    /// A `queued` or `leased` job exists for `task_id`.
    async fn has_live_job(&self, task_id: &TaskId) -> anyhow::Result<bool>;
}
