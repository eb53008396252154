//! Task admission: the check-and-charge step in front of the queue.
//!
//! Order is fixed and each refusal short-circuits the rest:
//! validate, resolve user, rate window, balance, charge + insert (one
//! transaction), enqueue. Only a committed charge produces a task, and only a
//! task gets enqueued.

use std::sync::Arc;

use tracing::{error, field, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::Rejection;
use crate::logger::annotate_span;
use crate::metrics::counters::Counters;
use crate::queue::WorkQueue;
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::task::model::{GenerationTask, NewTask, TaskKind, TaskParams};
use crate::task::repository::TaskRepository;
use crate::user::model::UserId;
use crate::user::repository::UserRepository;

#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub user_id: UserId,
    pub kind: TaskKind,
    pub params: TaskParams,
    /// Quoted by the front-end via `task::cost::estimate_cost`.
    pub cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(GenerationTask),
    Rejected(Rejection),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Limits applied at admission time.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    pub max_tasks_per_window: u32,
    pub window_hours: u32,
}

impl From<&AppConfig> for AdmissionPolicy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_tasks_per_window: cfg.max_tasks_per_user_per_hour,
            window_hours: cfg.rate_window_hours,
        }
    }
}

pub struct AdmissionService {
    users: Arc<dyn UserRepository>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<dyn WorkQueue>,
    limiter: RateLimiter,
    policy: AdmissionPolicy,
    counters: Counters,
}

impl AdmissionService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<dyn WorkQueue>,
        policy: AdmissionPolicy,
        counters: Counters,
    ) -> Self {
        Self {
            users,
            limiter: RateLimiter::new(tasks.clone()),
            tasks,
            queue,
            policy,
            counters,
        }
    }

    /// Admits or rejects one request.
    ///
    /// `Err` is a persistence failure: nothing was charged. A failed enqueue
    /// after the charge committed is not an error; the task stays `pending`
    /// for the reconciliation sweep.
    #[instrument(
        skip(self, req),
        target = "admission",
        fields(user_id = req.user_id, kind = %req.kind, cost = req.cost, task_id = field::Empty)
    )]
    pub async fn admit(&self, req: AdmissionRequest, now_ms: u64) -> anyhow::Result<Admission> {
        if let Err(reason) = self.validate(&req) {
            Counters::bump(&self.counters.rejected_invalid);
            return Ok(self.reject(Rejection::InvalidRequest(reason)));
        }

        // 1. user
        let Some(user) = self.users.fetch_by_id(req.user_id).await? else {
            Counters::bump(&self.counters.rejected_user_not_found);
            return Ok(self.reject(Rejection::UserNotFound(req.user_id)));
        };

        // 2. rate window
        let decision = self
            .limiter
            .check_and_admit(
                req.user_id,
                self.policy.window_hours,
                self.policy.max_tasks_per_window,
                now_ms,
            )
            .await?;

        if let RateDecision::Denied { .. } = decision {
            Counters::bump(&self.counters.rejected_rate_limit);
            return Ok(self.reject(Rejection::RateLimitExceeded {
                limit: self.policy.max_tasks_per_window,
                window_hours: self.policy.window_hours,
            }));
        }

        // 3. balance, as last observed
        if !user.can_afford(req.cost) {
            Counters::bump(&self.counters.rejected_insufficient);
            return Ok(self.reject(Rejection::InsufficientBalance {
                required: req.cost,
                available: user.tokens,
            }));
        }

        // 4. charge + insert, atomically
        let new_task = NewTask {
            task_id: Uuid::new_v4(),
            user_id: req.user_id,
            kind: req.kind,
            params: req.params,
            tokens_spent: req.cost,
            created_at_ms: now_ms,
        };

        let Some(task) = self.tasks.insert_charged(&new_task).await? else {
            // Balance moved between the check above and the guarded update.
            let available = self
                .users
                .fetch_by_id(req.user_id)
                .await?
                .map(|u| u.tokens)
                .unwrap_or(0);
            Counters::bump(&self.counters.rejected_insufficient);
            return Ok(self.reject(Rejection::InsufficientBalance {
                required: req.cost,
                available,
            }));
        };

        annotate_span(task.user_id, Some(&task.task_id));

        // 5. enqueue; the charge is already committed either way
        if let Err(e) = self.queue.enqueue(&task.task_id, now_ms).await {
            Counters::bump(&self.counters.enqueue_failures);
            error!(error = ?e, "enqueue failed; task left pending for reconciliation");
        }

        Counters::bump(&self.counters.admitted);
        info!(balance_before = user.tokens, "task admitted");

        Ok(Admission::Admitted(task))
    }

    fn validate(&self, req: &AdmissionRequest) -> Result<(), String> {
        if req.cost == 0 {
            return Err("cost must be positive".into());
        }
        req.params.validate(req.kind)
    }

    fn reject(&self, rejection: Rejection) -> Admission {
        warn!(code = rejection.code(), reason = %rejection, "admission rejected");
        Admission::Rejected(rejection)
    }
}
