use std::str::FromStr;
use std::time::Duration;

use crate::queue::RetryPolicy;
use crate::task::cost::is_high_cost;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,

    // =========================
    // Accounting
    // =========================
    /// Balance granted to a user on first contact.
    pub initial_tokens: u64,

    /// Tasks costing at least this many tokens need an explicit confirmation
    /// in the front-end. The core only exposes the comparison.
    pub high_cost_threshold: u64,

    // =========================
    // Rate limiting
    // =========================
    /// Maximum number of tasks a user may create inside the trailing window.
    ///
    /// This is a soft limit: concurrent admissions for the same user can
    /// both observe a count just below the cap and both be admitted.
    pub max_tasks_per_user_per_hour: u32,

    /// Length of the trailing window, in hours.
    pub rate_window_hours: u32,

    // =========================
    // Queue / workers
    // =========================
    /// Queue partition this process enqueues to and consumes from.
    pub queue_name: String,

    /// Number of executor workers polling the queue concurrently.
    pub worker_count: usize,

    /// Idle sleep between polls when the queue is empty.
    pub poll_interval: Duration,

    /// How long a leased job is hidden from other workers.
    ///
    /// Must exceed `provider_timeout`, otherwise a slow but healthy call is
    /// redelivered while still running.
    pub lease: Duration,

    /// Attempts per task and the backoff between them.
    pub retry: RetryPolicy,

    // =========================
    // Provider / delivery
    // =========================
    /// Image provider endpoint.
    pub provider_url: String,

    /// Bearer key for the provider.
    pub provider_api_key: String,

    /// Deadline for a single provider call; exceeding it is a failed attempt.
    pub provider_timeout: Duration,

    /// Webhook receiving user notifications. `None` logs them instead.
    pub delivery_webhook_url: Option<String>,

    // =========================
    // Reconciliation
    // =========================
    /// Age after which a task with no live queue job is considered stranded.
    pub stale_task_after: Duration,

    /// Cadence of the reconciliation sweep.
    pub reconcile_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://genqueue_dev.db?mode=rwc".to_string());

        let delivery_webhook_url = std::env::var("DELIVERY_WEBHOOK_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Self {
            database_url,
            initial_tokens: env_or("INITIAL_TOKENS", 10),
            high_cost_threshold: env_or("HIGH_COST_THRESHOLD", 4),

            max_tasks_per_user_per_hour: env_or("MAX_TASKS_PER_USER_PER_HOUR", 20),
            rate_window_hours: env_or("RATE_WINDOW_HOURS", 1),

            queue_name: std::env::var("QUEUE_NAME").unwrap_or_else(|_| "default".to_string()),
            worker_count: env_or::<usize>("WORKER_COUNT", 4).max(1),
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 500)),
            lease: Duration::from_millis(env_or("LEASE_MS", 120_000)),
            retry: RetryPolicy::default(),

            provider_url: std::env::var("PROVIDER_URL")
                .unwrap_or_else(|_| "http://localhost:8080/v1/images".to_string()),
            provider_api_key: std::env::var("PROVIDER_API_KEY").unwrap_or_default(),
            provider_timeout: Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 60)),
            delivery_webhook_url,

            stale_task_after: Duration::from_millis(env_or("STALE_TASK_AFTER_MS", 600_000)),
            reconcile_interval: Duration::from_millis(env_or("RECONCILE_INTERVAL_MS", 60_000)),
        }
    }

    pub fn is_high_cost(&self, cost: u64) -> bool {
        is_high_cost(cost, self.high_cost_threshold)
    }
}

/// Reads and parses `key`, falling back to `default` when unset or malformed.
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    parse_or(key, std::env::var(key).ok().as_deref(), default)
}

fn parse_or<T>(key: &str, raw: Option<&str>, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = %raw, ?default, "unparsable config value; using default");
            default
        }
    }
}
