use anyhow::Context;
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{i64_to_u32, u64_to_i64};
use crate::queue::{Delivery, JobId, JobStatus, RetryDecision, RetryPolicy, WorkQueue};
use crate::task::model::{MAX_ERROR_CHARS, TaskId, truncate_chars};

/// Candidates examined per `lease` call before giving up to contention.
const LEASE_CANDIDATES: usize = 8;

/// Queue backed by the `queue_jobs` table.
///
/// Several processes may share one table; each instance only sees jobs of
/// its own `queue_name`.
pub struct SqlxWorkQueue {
    pool: AnyPool,
    queue_name: String,
    policy: RetryPolicy,
}

impl SqlxWorkQueue {
    pub fn new(pool: AnyPool, queue_name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            policy,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl WorkQueue for SqlxWorkQueue {
    #[instrument(skip(self), target = "queue", fields(queue = %self.queue_name))]
    async fn enqueue(&self, task_id: &TaskId, now_ms: u64) -> anyhow::Result<JobId> {
        let job_id = Uuid::new_v4();
        let now = u64_to_i64(now_ms)?;

        sqlx::query(
            r#"
INSERT INTO queue_jobs (job_id, queue, task_id, status, attempts, max_attempts, run_at_ms, leased_until_ms, enqueued_at_ms, last_error)
VALUES (?, ?, ?, ?, 0, ?, ?, 0, ?, NULL);
"#,
        )
        .bind(job_id.to_string())
        .bind(self.queue_name.clone())
        .bind(task_id.to_string())
        .bind(JobStatus::Queued.as_str())
        .bind(i64::from(self.policy.max_attempts))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("insert queue job")?;

        debug!(%job_id, "job enqueued");
        Ok(job_id)
    }

    async fn lease(&self, now_ms: u64, lease_ms: u64) -> anyhow::Result<Option<Delivery>> {
        let now = u64_to_i64(now_ms)?;
        let until = u64_to_i64(now_ms.saturating_add(lease_ms))?;

        let candidates = sqlx::query(
            r#"
SELECT job_id, task_id, status, attempts, max_attempts
FROM queue_jobs
WHERE queue = ?
  AND (
    (status = 'queued' AND run_at_ms <= ?)
    OR (status = 'leased' AND leased_until_ms <= ? AND attempts < max_attempts)
  )
ORDER BY run_at_ms ASC, enqueued_at_ms ASC
LIMIT ?;
"#,
        )
        .bind(self.queue_name.clone())
        .bind(now)
        .bind(now)
        .bind(LEASE_CANDIDATES as i64)
        .fetch_all(&self.pool)
        .await?;

        for r in candidates {
            let job_id_str: String = r.get("job_id");
            let status: String = r.get("status");
            let attempts: i64 = r.get("attempts");

            // Claim only if nobody touched the row since we read it.
            let res = sqlx::query(
                r#"
UPDATE queue_jobs
SET status = 'leased', attempts = attempts + 1, leased_until_ms = ?
WHERE job_id = ? AND status = ? AND attempts = ?;
"#,
            )
            .bind(until)
            .bind(job_id_str.clone())
            .bind(status.clone())
            .bind(attempts)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() != 1 {
                debug!(job_id = %job_id_str, "lost lease race");
                continue;
            }

            if status == JobStatus::Leased.as_str() {
                warn!(job_id = %job_id_str, attempts, "re-delivering job after lease expiry");
            }

            let task_id_str: String = r.get("task_id");
            return Ok(Some(Delivery {
                job_id: Uuid::parse_str(&job_id_str).context("invalid job_id")?,
                task_id: Uuid::parse_str(&task_id_str).context("invalid task_id")?,
                attempt: i64_to_u32(attempts + 1)?,
                max_attempts: i64_to_u32(r.get("max_attempts"))?,
            }));
        }

        Ok(None)
    }

    async fn ack(&self, job_id: &JobId) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE queue_jobs
SET status = 'done', leased_until_ms = 0
WHERE job_id = ?;
"#,
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, error), target = "queue")]
    async fn retry(
        &self,
        job_id: &JobId,
        error: &str,
        now_ms: u64,
    ) -> anyhow::Result<RetryDecision> {
        let row = sqlx::query("SELECT attempts, max_attempts FROM queue_jobs WHERE job_id = ?;")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("job {job_id} not found"))?;

        let attempts = i64_to_u32(row.get("attempts"))?;
        let max_attempts = i64_to_u32(row.get("max_attempts"))?;
        let error = truncate_chars(error, MAX_ERROR_CHARS);

        let next = if attempts >= max_attempts {
            None
        } else {
            self.policy.next_run_at_ms(now_ms, attempts)
        };

        match next {
            Some(run_at_ms) => {
                sqlx::query(
                    r#"
UPDATE queue_jobs
SET status = 'queued', run_at_ms = ?, leased_until_ms = 0, last_error = ?
WHERE job_id = ?;
"#,
                )
                .bind(u64_to_i64(run_at_ms)?)
                .bind(error)
                .bind(job_id.to_string())
                .execute(&self.pool)
                .await?;

                info!(attempts, run_at_ms, "job scheduled for retry");
                Ok(RetryDecision::Scheduled { run_at_ms })
            }
            None => {
                sqlx::query(
                    r#"
UPDATE queue_jobs
SET status = 'dead', leased_until_ms = 0, last_error = ?
WHERE job_id = ?;
"#,
                )
                .bind(error)
                .bind(job_id.to_string())
                .execute(&self.pool)
                .await?;

                warn!(attempts, "job exhausted its attempts");
                Ok(RetryDecision::Exhausted)
            }
        }
    }

    async fn reap_expired(&self, now_ms: u64) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
UPDATE queue_jobs
SET status = 'dead', last_error = 'lease expired on final attempt'
WHERE queue = ? AND status = 'leased' AND leased_until_ms <= ? AND attempts >= max_attempts;
"#,
        )
        .bind(self.queue_name.clone())
        .bind(u64_to_i64(now_ms)?)
        .execute(&self.pool)
        .await?;

        let reaped = res.rows_affected();
        if reaped > 0 {
            warn!(target: "queue", reaped, "buried jobs whose final lease expired");
        }
        Ok(reaped)
    }

    async fn has_live_job(&self, task_id: &TaskId) -> anyhow::Result<bool> {
        let row = sqlx::query(
            r#"
SELECT COUNT(*) AS n
FROM queue_jobs
WHERE task_id = ? AND status IN ('queued', 'leased');
"#,
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("n") > 0)
    }
}
