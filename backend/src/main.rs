use std::sync::Arc;

use clap::Parser;
use sqlx::AnyPool;
use tokio::sync::watch;

use genqueue::{
    admission::{Admission, AdmissionPolicy, AdmissionRequest, AdmissionService},
    cli::{Cli, Command, cli_to_kind, cli_to_quality},
    config::AppConfig,
    db::Db,
    delivery::{DeliveryChannel, LogDelivery, WebhookDelivery},
    execution::{
        executor::TaskExecutor,
        worker::{WorkerPool, WorkerSettings},
    },
    ledger::{BalanceLedger, ledger_sqlx::SqlxBalanceLedger},
    logger::init_tracing,
    metrics::counters::Counters,
    provider::HttpImageProvider,
    queue::queue_sqlx::SqlxWorkQueue,
    reconcile::Reconciler,
    task::{
        cost::estimate_cost,
        model::{ImageQuality, ImageSize, TaskKind, TaskParams},
        repository::TaskRepository,
        repository_sqlx::SqlxTaskRepository,
    },
    time::now_ms,
    user::{
        model::{NewUser, ProviderModel},
        repository::UserRepository,
        repository_sqlx::SqlxUserRepository,
    },
};

/// Webhook delivery when configured, log delivery otherwise.
fn build_delivery(cfg: &AppConfig) -> Arc<dyn DeliveryChannel> {
    match &cfg.delivery_webhook_url {
        Some(url) => Arc::new(WebhookDelivery::new(url.clone())),
        None => {
            tracing::warn!("DELIVERY_WEBHOOK_URL not set; notifications go to the log");
            Arc::new(LogDelivery)
        }
    }
}

fn build_queue(pool: &AnyPool, cfg: &AppConfig) -> Arc<SqlxWorkQueue> {
    Arc::new(SqlxWorkQueue::new(
        pool.clone(),
        cfg.queue_name.clone(),
        cfg.retry.clone(),
    ))
}

fn build_reconciler(pool: &AnyPool, cfg: &AppConfig, counters: &Counters) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        Arc::new(SqlxTaskRepository::new(pool.clone())),
        build_queue(pool, cfg),
        build_delivery(cfg),
        cfg.retry.max_attempts,
        cfg.stale_task_after,
        counters.clone(),
    ))
}

/// Runs the worker pool plus the periodic sweep until Ctrl-C, or until the
/// queue drains in burst mode.
async fn work(pool: &AnyPool, cfg: &AppConfig, burst: bool) -> anyhow::Result<()> {
    let counters = Counters::default();

    let tasks: Arc<dyn TaskRepository> = Arc::new(SqlxTaskRepository::new(pool.clone()));
    let provider = Arc::new(HttpImageProvider::new(
        cfg.provider_url.clone(),
        cfg.provider_api_key.clone(),
        cfg.provider_timeout,
    )?);

    let executor = Arc::new(TaskExecutor::new(
        tasks,
        provider,
        build_delivery(cfg),
        cfg.retry.max_attempts,
        cfg.provider_timeout,
        counters.clone(),
    ));

    // Restart recovery: re-home tasks stranded by a previous process.
    let reconciler = build_reconciler(pool, cfg, &counters);
    let report = reconciler.sweep(now_ms()).await?;
    tracing::info!(?report, "startup reconciliation done");

    let queue = build_queue(pool, cfg);
    let queue_name = queue.queue_name().to_string();
    let workers = WorkerPool::new(
        cfg.worker_count,
        queue,
        executor,
        WorkerSettings {
            lease: cfg.lease,
            poll_interval: cfg.poll_interval,
        },
        counters.clone(),
    );
    tracing::info!(
        queue = %queue_name,
        workers = workers.size(),
        burst,
        "worker pool starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if !burst {
        tokio::spawn(
            reconciler
                .clone()
                .run(cfg.reconcile_interval, shutdown_rx.clone()),
        );
    }

    let mut pool_handle = tokio::spawn(workers.run(shutdown_rx, burst));

    tokio::select! {
        res = &mut pool_handle => {
            res?;
            tracing::info!("queue drained");
            return Ok(());
        }
        sig = tokio::signal::ctrl_c() => {
            sig?;
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    pool_handle.await?;

    tracing::info!(
        done = Counters::get(&counters.exec_done),
        failed = Counters::get(&counters.exec_failed),
        refunds = Counters::get(&counters.refunds),
        "workers stopped"
    );
    Ok(())
}

async fn submit(
    pool: &AnyPool,
    cfg: &AppConfig,
    user_id: i64,
    kind: TaskKind,
    params: TaskParams,
    overrides: (Option<ImageQuality>, Option<ImageSize>),
    multiplier: u32,
) -> anyhow::Result<()> {
    let users: Arc<dyn UserRepository> = Arc::new(SqlxUserRepository::new(pool.clone()));
    let tasks: Arc<dyn TaskRepository> = Arc::new(SqlxTaskRepository::new(pool.clone()));

    let (user, created) = users
        .get_or_create(
            &NewUser {
                user_id,
                ..Default::default()
            },
            cfg.initial_tokens,
            now_ms(),
        )
        .await?;
    if created {
        println!("created user {} with {} tokens", user.user_id, user.tokens);
    }

    let (quality, size) = overrides;
    let mut params = params;
    params.model = user.selected_model;
    params.quality = quality.unwrap_or(user.image_quality);
    params.size = size.unwrap_or(user.image_size);

    let cost = estimate_cost(params.quality, params.size, multiplier);
    if cfg.is_high_cost(cost) {
        println!("note: high-cost request ({cost} tokens)");
    }

    let service = AdmissionService::new(
        users,
        tasks,
        build_queue(pool, cfg),
        AdmissionPolicy::from(cfg),
        Counters::default(),
    );

    let outcome = service
        .admit(
            AdmissionRequest {
                user_id,
                kind,
                params,
                cost,
            },
            now_ms(),
        )
        .await?;

    match outcome {
        Admission::Admitted(task) => println!("{}", serde_json::to_string_pretty(&task)?),
        Admission::Rejected(r) => println!("rejected [{}]: {}", r.code(), r.user_text()),
    }
    Ok(())
}

async fn settings(
    pool: &AnyPool,
    user_id: i64,
    model: Option<ProviderModel>,
    quality: Option<ImageQuality>,
    size: Option<ImageSize>,
) -> anyhow::Result<()> {
    let users = SqlxUserRepository::new(pool.clone());
    let now = now_ms();

    let mut found = match model {
        Some(m) => users.set_model(user_id, m, now).await?,
        None => true,
    };
    if quality.is_some() || size.is_some() {
        found &= users.set_image_settings(user_id, quality, size, now).await?;
    }

    match users.fetch_by_id(user_id).await? {
        Some(u) if found => println!(
            "user {}: model {}  quality {}  size {}",
            u.user_id, u.selected_model, u.image_quality, u.image_size
        ),
        _ => println!("user {user_id} not found"),
    }
    Ok(())
}

async fn history(pool: &AnyPool, user_id: i64, limit: usize) -> anyhow::Result<()> {
    let ledger = SqlxBalanceLedger::new(pool.clone());
    let tasks = SqlxTaskRepository::new(pool.clone());

    let Some(balance) = ledger.balance(user_id).await? else {
        println!("user {user_id} not found");
        return Ok(());
    };
    let outstanding = tasks.outstanding_spend(user_id).await?;

    println!("balance: {balance}  outstanding spend: {outstanding}");
    for t in tasks.history(user_id, limit).await? {
        println!(
            "{}  {:<10} {:>3} tok  {}",
            t.task_id, t.status, t.tokens_spent, t.params.prompt
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    let mut cfg = AppConfig::from_env();

    let cli = Cli::parse();

    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;

    match cli.command {
        Command::Work {
            queue,
            burst,
            workers,
        } => {
            if let Some(q) = queue {
                cfg.queue_name = q;
            }
            if let Some(n) = workers {
                cfg.worker_count = n.max(1);
            }
            tracing::info!("Starting genqueue worker...");
            work(&db.pool, &cfg, burst).await
        }
        Command::Submit {
            user,
            prompt,
            kind,
            quality,
            size,
            source_image,
            multiplier,
        } => {
            let mut params = TaskParams::generate(prompt);
            params.source_image = source_image;
            let overrides = (quality.map(cli_to_quality), size);
            submit(&db.pool, &cfg, user, cli_to_kind(kind), params, overrides, multiplier).await
        }
        Command::Settings {
            user,
            model,
            quality,
            size,
        } => settings(&db.pool, user, model, quality.map(cli_to_quality), size).await,
        Command::Reconcile => {
            let report = build_reconciler(&db.pool, &cfg, &Counters::default())
                .sweep(now_ms())
                .await?;
            println!("{report:?}");
            Ok(())
        }
        Command::History { user, limit } => history(&db.pool, user, limit).await,
    }
}
