use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{i64_to_u32, i64_to_u64, u64_to_i64};
use crate::ledger::{credit_in, deduct_in};
use crate::logger::warn_if_slow;
use crate::task::model::{
    GenerationTask, MAX_ERROR_CHARS, NewTask, TaskId, TaskParams, TaskStatus, truncate_chars,
};
use crate::task::repository::TaskRepository;
use crate::user::model::UserId;

const TASK_COLUMNS: &str = r#"
  task_id, user_id, kind, prompt, quality, size, model, source_image,
  status, tokens_spent, retry_count, error_message, result_ref, refunded,
  created_at_ms, updated_at_ms
"#;

const SLOW_QUERY: Duration = Duration::from_millis(250);

/// SQLx-backed task store.
/// Owns every write to `generation_tasks.status` and the result fields.
pub struct SqlxTaskRepository {
    pool: AnyPool,
}

impl SqlxTaskRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Plain status flip guarded by the transition table and the prior status.
    async fn flip(
        &self,
        task_id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
        now_ms: u64,
    ) -> anyhow::Result<bool> {
        from.ensure_transition(to)?;

        let res = sqlx::query(
            r#"
UPDATE generation_tasks
SET status = ?, updated_at_ms = ?
WHERE task_id = ? AND status = ?;
"#,
        )
        .bind(to.as_str())
        .bind(u64_to_i64(now_ms)?)
        .bind(task_id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    #[instrument(
        skip(self, task),
        target = "store",
        fields(user_id = task.user_id, task_id = %task.task_id, cost = task.tokens_spent)
    )]
    async fn insert_charged(&self, task: &NewTask) -> anyhow::Result<Option<GenerationTask>> {
        let mut tx = self.pool.begin().await?;

        if !deduct_in(&mut tx, task.user_id, task.tokens_spent, task.created_at_ms).await? {
            tx.rollback().await?;
            debug!("charge refused inside admission transaction");
            return Ok(None);
        }

        let created = u64_to_i64(task.created_at_ms)?;
        sqlx::query(
            r#"
INSERT INTO generation_tasks (
  task_id, user_id, kind, prompt, quality, size, model, source_image,
  status, tokens_spent, retry_count, error_message, result_ref, refunded,
  created_at_ms, updated_at_ms
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, 0, ?, ?);
"#,
        )
        .bind(task.task_id.to_string())
        .bind(task.user_id)
        .bind(task.kind.to_string())
        .bind(task.params.prompt.clone())
        .bind(task.params.quality.to_string())
        .bind(task.params.size.to_string())
        .bind(task.params.model.as_str())
        .bind(task.params.source_image.clone())
        .bind(TaskStatus::Pending.as_str())
        .bind(u64_to_i64(task.tokens_spent)?)
        .bind(created)
        .bind(created)
        .execute(&mut *tx)
        .await
        .context("insert generation task")?;

        tx.commit().await?;

        info!("task charged and persisted");

        Ok(Some(GenerationTask {
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
        }))
    }

    async fn fetch_by_id(&self, task_id: &TaskId) -> anyhow::Result<Option<GenerationTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM generation_tasks WHERE task_id = ?;");
        let row = sqlx::query(&sql)
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(row_to_task(&r)?)),
            None => Ok(None),
        }
    }

    async fn count_created_since(&self, user_id: UserId, since_ms: u64) -> anyhow::Result<u64> {
        let row = warn_if_slow(
            "count_created_since",
            SLOW_QUERY,
            sqlx::query(
                r#"
SELECT COUNT(*) AS n
FROM generation_tasks
WHERE user_id = ? AND created_at_ms >= ?;
"#,
            )
            .bind(user_id)
            .bind(u64_to_i64(since_ms)?)
            .fetch_one(&self.pool),
        )
        .await?;

        i64_to_u64(row.get("n"))
    }

    #[instrument(skip(self), target = "store")]
    async fn claim(&self, task_id: &TaskId, now_ms: u64) -> anyhow::Result<bool> {
        self.flip(task_id, TaskStatus::Pending, TaskStatus::Processing, now_ms)
            .await
    }

    #[instrument(skip(self, result_ref), target = "store")]
    async fn complete(
        &self,
        task_id: &TaskId,
        result_ref: &str,
        now_ms: u64,
    ) -> anyhow::Result<bool> {
        TaskStatus::Processing.ensure_transition(TaskStatus::Done)?;

        let res = sqlx::query(
            r#"
UPDATE generation_tasks
SET status = ?, result_ref = ?, updated_at_ms = ?
WHERE task_id = ? AND status = ?;
"#,
        )
        .bind(TaskStatus::Done.as_str())
        .bind(result_ref.to_string())
        .bind(u64_to_i64(now_ms)?)
        .bind(task_id.to_string())
        .bind(TaskStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self, error), target = "store")]
    async fn release_for_retry(
        &self,
        task_id: &TaskId,
        error: &str,
        now_ms: u64,
    ) -> anyhow::Result<bool> {
        TaskStatus::Processing.ensure_transition(TaskStatus::Pending)?;

        let res = sqlx::query(
            r#"
UPDATE generation_tasks
SET status = ?, retry_count = retry_count + 1, error_message = ?, updated_at_ms = ?
WHERE task_id = ? AND status = ?;
"#,
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(truncate_chars(error, MAX_ERROR_CHARS))
        .bind(u64_to_i64(now_ms)?)
        .bind(task_id.to_string())
        .bind(TaskStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self, error), target = "store")]
    async fn fail_and_refund(
        &self,
        task_id: &TaskId,
        error: &str,
        now_ms: u64,
    ) -> anyhow::Result<Option<u64>> {
        TaskStatus::Pending.ensure_transition(TaskStatus::Failed)?;
        TaskStatus::Processing.ensure_transition(TaskStatus::Failed)?;

        let mut tx = self.pool.begin().await?;

        // The guarded UPDATE must open the transaction: SQLite cannot upgrade
        // a reader to a writer while another writer holds the lock.
        // Failing out of `processing` burns one more attempt.
        let res = sqlx::query(
            r#"
UPDATE generation_tasks
SET status = ?,
    refunded = 1,
    retry_count = retry_count + CASE WHEN status = ? THEN 1 ELSE 0 END,
    error_message = ?,
    updated_at_ms = ?
WHERE task_id = ? AND status IN (?, ?) AND refunded = 0;
"#,
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(TaskStatus::Processing.as_str())
        .bind(truncate_chars(error, MAX_ERROR_CHARS))
        .bind(u64_to_i64(now_ms)?)
        .bind(task_id.to_string())
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::Processing.as_str())
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() != 1 {
            tx.rollback().await?;
            if self.fetch_by_id(task_id).await?.is_none() {
                bail!("task {task_id} not found");
            }
            debug!("task already terminal or refunded; refund skipped");
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
SELECT user_id, tokens_spent
FROM generation_tasks
WHERE task_id = ?;
"#,
        )
        .bind(task_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let user_id: UserId = row.get("user_id");
        let tokens_spent = i64_to_u64(row.get("tokens_spent"))?;

        if !credit_in(&mut tx, user_id, tokens_spent, now_ms).await? {
            // Dropping the transaction rolls the status change back.
            bail!("refund target user {user_id} missing for task {task_id}");
        }

        tx.commit().await?;

        warn!(user_id, tokens_spent, "task failed; tokens refunded");
        Ok(Some(tokens_spent))
    }

    async fn find_stale(
        &self,
        status: TaskStatus,
        updated_before_ms: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<GenerationTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM generation_tasks \
             WHERE status = ? AND updated_at_ms < ? \
             ORDER BY updated_at_ms ASC LIMIT ?;"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(u64_to_i64(updated_before_ms)?)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_task(&r) {
                Ok(t) => out.push(t),
                Err(e) => {
                    // poison-row resilience: skip but keep sweeping
                    warn!(error = %e, "skipping malformed task row");
                }
            }
        }
        Ok(out)
    }

    async fn history(&self, user_id: UserId, limit: usize) -> anyhow::Result<Vec<GenerationTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM generation_tasks \
             WHERE user_id = ? \
             ORDER BY created_at_ms DESC LIMIT ?;"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_task).collect()
    }

    async fn outstanding_spend(&self, user_id: UserId) -> anyhow::Result<u64> {
        let row = sqlx::query(
            r#"
SELECT COALESCE(SUM(tokens_spent), 0) AS spent
FROM generation_tasks
WHERE user_id = ? AND refunded = 0;
"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        i64_to_u64(row.get("spent"))
    }
}

/* =========================
Row mapping
========================= */

fn row_to_task(r: &sqlx::any::AnyRow) -> anyhow::Result<GenerationTask> {
    let id_str: String = r.get("task_id");
    let task_id = Uuid::parse_str(&id_str).context("invalid task_id")?;

    Ok(GenerationTask {
        task_id,
        user_id: r.get::<i64, _>("user_id"),
        kind: r.get::<String, _>("kind").parse()?,
        params: TaskParams {
            prompt: r.get::<String, _>("prompt"),
            quality: r.get::<String, _>("quality").parse()?,
            size: r.get::<String, _>("size").parse()?,
            model: r.get::<String, _>("model").parse()?,
            source_image: r.get::<Option<String>, _>("source_image"),
        },
        status: r.get::<String, _>("status").parse()?,
        tokens_spent: i64_to_u64(r.get("tokens_spent"))?,
        retry_count: i64_to_u32(r.get("retry_count"))?,
        error_message: r.get::<Option<String>, _>("error_message"),
        result_ref: r.get::<Option<String>, _>("result_ref"),
        refunded: r.get::<i64, _>("refunded") == 1,
        created_at_ms: i64_to_u64(r.get("created_at_ms"))?,
        updated_at_ms: i64_to_u64(r.get("updated_at_ms"))?,
    })
}
