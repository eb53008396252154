//! Per-user trailing-window limiter.
//!
//! No counter state of its own: the window is a count over task creation
//! timestamps, so admitting a task is what "records" it. Two concurrent
//! admissions for one user can both read `max - 1` and both pass; the cap is
//! soft by that margin.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::task::repository::TaskRepository;
use crate::time::window_start_ms;
use crate::user::model::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// `remaining` admissions left in the window, this one included.
    Allowed { remaining: u32 },
    /// `count` tasks already inside the window.
    Denied { count: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    tasks: Arc<dyn TaskRepository>,
}

impl RateLimiter {
    pub fn new(tasks: Arc<dyn TaskRepository>) -> Self {
        Self { tasks }
    }

    #[instrument(skip(self), target = "admission")]
    pub async fn check_and_admit(
        &self,
        user_id: UserId,
        window_hours: u32,
        max_tasks: u32,
        now_ms: u64,
    ) -> anyhow::Result<RateDecision> {
        let since = window_start_ms(now_ms, window_hours);
        let count = self.tasks.count_created_since(user_id, since).await?;

        if count >= u64::from(max_tasks) {
            debug!(count, "rate window full");
            return Ok(RateDecision::Denied { count });
        }

        // count < max_tasks <= u32::MAX, so the difference fits.
        let remaining = max_tasks - count as u32;
        Ok(RateDecision::Allowed { remaining })
    }
}
