//! Hand-written doubles shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::delivery::{DeliveryChannel, Notification};
use crate::provider::{ImageProvider, ProviderError, ProviderOutput};
use crate::queue::{Delivery, JobId, RetryDecision, WorkQueue};
use crate::task::model::{
    GenerationTask, ImageQuality, ImageSize, NewTask, TaskId, TaskKind, TaskParams, TaskStatus,
};
use crate::task::repository::TaskRepository;
use crate::user::model::{NewUser, ProviderModel, User, UserId};
use crate::user::repository::UserRepository;

pub(crate) fn pending_task(user_id: UserId, cost: u64) -> GenerationTask {
    GenerationTask {
        task_id: Uuid::new_v4(),
        user_id,
        kind: TaskKind::Generate,
        params: TaskParams::generate("a lighthouse at dusk"),
        status: TaskStatus::Pending,
        tokens_spent: cost,
        retry_count: 0,
        error_message: None,
        result_ref: None,
        refunded: false,
        created_at_ms: 1_000,
        updated_at_ms: 1_000,
    }
}

/// In-memory task store with the same compare-and-set rules as the sqlx one.
#[derive(Default)]
pub(crate) struct MemTasks {
    pub tasks: Mutex<HashMap<TaskId, GenerationTask>>,
    pub credited: Mutex<Vec<(UserId, u64)>>,
    /// Simulates losing the balance race: every charged insert is refused.
    pub refuse_charge: bool,
}

impl MemTasks {
    pub fn with(tasks: impl IntoIterator<Item = GenerationTask>) -> Self {
        let me = Self::default();
        for t in tasks {
            me.tasks.lock().insert(t.task_id, t);
        }
        me
    }

    pub fn get(&self, id: &TaskId) -> GenerationTask {
        self.tasks.lock()[id].clone()
    }

    fn cas(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
        f: impl FnOnce(&mut GenerationTask),
    ) -> anyhow::Result<bool> {
        from.ensure_transition(to)?;
        let mut g = self.tasks.lock();
        match g.get_mut(id) {
            Some(t) if t.status == from => {
                t.status = to;
                f(t);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl TaskRepository for MemTasks {
    async fn insert_charged(&self, task: &NewTask) -> anyhow::Result<Option<GenerationTask>> {
        if self.refuse_charge {
            return Ok(None);
        }
        let t = GenerationTask {
            task_id: task.task_id,
            user_id: task.user_id,
            kind: task.kind,
            params: task.params.clone(),
            status: TaskStatus::Pending,
            tokens_spent: task.tokens_spent,
            retry_count: 0,
            error_message: None,
            result_ref: None,
            refunded: false,
            created_at_ms: task.created_at_ms,
            updated_at_ms: task.created_at_ms,
        };
        self.tasks.lock().insert(t.task_id, t.clone());
        Ok(Some(t))
    }

    async fn fetch_by_id(&self, task_id: &TaskId) -> anyhow::Result<Option<GenerationTask>> {
        Ok(self.tasks.lock().get(task_id).cloned())
    }

    async fn count_created_since(&self, user_id: UserId, since_ms: u64) -> anyhow::Result<u64> {
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|t| t.user_id == user_id && t.created_at_ms >= since_ms)
            .count() as u64)
    }

    async fn claim(&self, task_id: &TaskId, _: u64) -> anyhow::Result<bool> {
        self.cas(task_id, TaskStatus::Pending, TaskStatus::Processing, |_| {})
    }

    async fn complete(&self, task_id: &TaskId, result_ref: &str, _: u64) -> anyhow::Result<bool> {
        self.cas(task_id, TaskStatus::Processing, TaskStatus::Done, |t| {
            t.result_ref = Some(result_ref.to_string())
        })
    }

    async fn release_for_retry(
        &self,
        task_id: &TaskId,
        error: &str,
        _: u64,
    ) -> anyhow::Result<bool> {
        self.cas(task_id, TaskStatus::Processing, TaskStatus::Pending, |t| {
            t.retry_count += 1;
            t.error_message = Some(error.to_string());
        })
    }

    async fn fail_and_refund(
        &self,
        task_id: &TaskId,
        error: &str,
        _: u64,
    ) -> anyhow::Result<Option<u64>> {
        let mut g = self.tasks.lock();
        let Some(t) = g.get_mut(task_id) else {
            anyhow::bail!("task {task_id} not found");
        };
        if t.status.is_terminal() || t.refunded {
            return Ok(None);
        }
        if t.status == TaskStatus::Processing {
            t.retry_count += 1;
        }
        t.status = TaskStatus::Failed;
        t.refunded = true;
        t.error_message = Some(error.to_string());
        self.credited.lock().push((t.user_id, t.tokens_spent));
        Ok(Some(t.tokens_spent))
    }

    async fn find_stale(
        &self,
        status: TaskStatus,
        updated_before_ms: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<GenerationTask>> {
        let mut out: Vec<_> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.status == status && t.updated_at_ms < updated_before_ms)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.updated_at_ms);
        out.truncate(limit);
        Ok(out)
    }

    async fn history(&self, user_id: UserId, limit: usize) -> anyhow::Result<Vec<GenerationTask>> {
        let mut out: Vec<_> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        out.truncate(limit);
        Ok(out)
    }

    async fn outstanding_spend(&self, user_id: UserId) -> anyhow::Result<u64> {
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|t| t.user_id == user_id && !t.refunded)
            .map(|t| t.tokens_spent)
            .sum())
    }
}

/// Provider that replays scripted results, then succeeds.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    pub script: Mutex<VecDeque<Result<ProviderOutput, ProviderError>>>,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn failing(times: usize) -> Self {
        let script = (0..times)
            .map(|i| Err(ProviderError::Rejected(format!("boom {i}"))))
            .collect();
        Self {
            script: Mutex::new(script),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageProvider for ScriptedProvider {
    async fn execute(&self, _: TaskKind, _: &TaskParams) -> Result<ProviderOutput, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| {
            Ok(ProviderOutput {
                result_ref: format!("https://cdn.test/{n}.png"),
            })
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingDelivery {
    pub sent: Mutex<Vec<(UserId, Notification)>>,
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn notify(&self, user_id: UserId, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().push((user_id, notification.clone()));
        Ok(())
    }
}

/// Records enqueues; `live` marks tasks that already have a queued/leased job.
#[derive(Default)]
pub(crate) struct MemQueue {
    pub enqueued: Mutex<Vec<TaskId>>,
    pub live: Mutex<HashSet<TaskId>>,
    pub fail_enqueue: bool,
}

#[async_trait]
impl WorkQueue for MemQueue {
    async fn enqueue(&self, task_id: &TaskId, _: u64) -> anyhow::Result<JobId> {
        if self.fail_enqueue {
            anyhow::bail!("queue unavailable");
        }
        self.enqueued.lock().push(*task_id);
        self.live.lock().insert(*task_id);
        Ok(Uuid::new_v4())
    }

    async fn lease(&self, _: u64, _: u64) -> anyhow::Result<Option<Delivery>> {
        Ok(None)
    }

    async fn ack(&self, _: &JobId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn retry(&self, _: &JobId, _: &str, _: u64) -> anyhow::Result<RetryDecision> {
        Ok(RetryDecision::Exhausted)
    }

    async fn reap_expired(&self, _: u64) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn has_live_job(&self, task_id: &TaskId) -> anyhow::Result<bool> {
        Ok(self.live.lock().contains(task_id))
    }
}

/// Fixed user directory.
#[derive(Default)]
pub(crate) struct MemUsers {
    pub users: Mutex<HashMap<UserId, User>>,
}

impl MemUsers {
    pub fn with_balance(user_id: UserId, tokens: u64) -> Self {
        let me = Self::default();
        me.users.lock().insert(
            user_id,
            User {
                user_id,
                username: None,
                first_name: None,
                tokens,
                selected_model: ProviderModel::default(),
                image_quality: ImageQuality::default(),
                image_size: ImageSize::default(),
                created_at_ms: 1_000,
                updated_at_ms: 1_000,
            },
        );
        me
    }
}

#[async_trait]
impl UserRepository for MemUsers {
    async fn fetch_by_id(&self, user_id: UserId) -> anyhow::Result<Option<User>> {
        Ok(self.users.lock().get(&user_id).cloned())
    }

    async fn get_or_create(
        &self,
        new_user: &NewUser,
        initial_tokens: u64,
        now_ms: u64,
    ) -> anyhow::Result<(User, bool)> {
        let mut g = self.users.lock();
        if let Some(u) = g.get(&new_user.user_id) {
            return Ok((u.clone(), false));
        }
        let user = User {
            user_id: new_user.user_id,
            username: new_user.username.clone(),
            first_name: new_user.first_name.clone(),
            tokens: initial_tokens,
            selected_model: ProviderModel::default(),
            image_quality: ImageQuality::default(),
            image_size: ImageSize::default(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        g.insert(user.user_id, user.clone());
        Ok((user, true))
    }

    async fn set_model(&self, user_id: UserId, model: ProviderModel, now_ms: u64) -> anyhow::Result<bool> {
        Ok(match self.users.lock().get_mut(&user_id) {
            Some(u) => {
                u.selected_model = model;
                u.updated_at_ms = now_ms;
                true
            }
            None => false,
        })
    }

    async fn set_image_settings(
        &self,
        user_id: UserId,
        quality: Option<ImageQuality>,
        size: Option<ImageSize>,
        now_ms: u64,
    ) -> anyhow::Result<bool> {
        Ok(match self.users.lock().get_mut(&user_id) {
            Some(u) => {
                if let Some(q) = quality {
                    u.image_quality = q;
                }
                if let Some(s) = size {
                    u.image_size = s;
                }
                u.updated_at_ms = now_ms;
                true
            }
            None => false,
        })
    }
}
