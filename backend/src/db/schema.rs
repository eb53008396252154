use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Users
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS users (
  user_id BIGINT PRIMARY KEY,
  username TEXT,
  first_name TEXT,
  tokens BIGINT NOT NULL CHECK (tokens >= 0),
  selected_model TEXT NOT NULL DEFAULT 'gpt-image-1',
  image_quality TEXT NOT NULL DEFAULT 'medium',
  image_size TEXT NOT NULL DEFAULT '1024x1024',
  created_at_ms BIGINT NOT NULL,
  updated_at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Generation tasks (append-only audit trail, never deleted)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS generation_tasks (
  task_id TEXT PRIMARY KEY,
  user_id BIGINT NOT NULL REFERENCES users(user_id),
  kind TEXT NOT NULL,
  prompt TEXT NOT NULL,
  quality TEXT NOT NULL,
  size TEXT NOT NULL,
  model TEXT NOT NULL,
  source_image TEXT,
  status TEXT NOT NULL,
  tokens_spent BIGINT NOT NULL CHECK (tokens_spent > 0),
  retry_count BIGINT NOT NULL DEFAULT 0,
  error_message TEXT,
  result_ref TEXT,
  refunded INTEGER NOT NULL DEFAULT 0 CHECK (refunded IN (0,1)),
  created_at_ms BIGINT NOT NULL,
  updated_at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Durable work queue
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
  job_id TEXT PRIMARY KEY,
  queue TEXT NOT NULL,
  task_id TEXT NOT NULL,
  status TEXT NOT NULL,
  attempts BIGINT NOT NULL DEFAULT 0,
  max_attempts BIGINT NOT NULL,
  run_at_ms BIGINT NOT NULL,
  leased_until_ms BIGINT NOT NULL DEFAULT 0,
  enqueued_at_ms BIGINT NOT NULL,
  last_error TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_tasks_user_created ON generation_tasks(user_id, created_at_ms);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON generation_tasks(status, updated_at_ms);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_jobs_runnable ON queue_jobs(queue, status, run_at_ms);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_jobs_task ON queue_jobs(task_id);"#)
        .execute(pool)
        .await?;

    Ok(())
}
