mod support;

use std::sync::Arc;

use tokio::task::JoinSet;
use uuid::Uuid;

use genqueue::ledger::BalanceLedger;
use genqueue::ledger::ledger_sqlx::SqlxBalanceLedger;
use genqueue::task::model::{NewTask, TaskKind, TaskParams, TaskStatus};
use genqueue::task::repository::TaskRepository;
use genqueue::task::repository_sqlx::SqlxTaskRepository;

use support::{prompt, seed_user, setup_db, setup_file_db};

fn new_task(user_id: i64, cost: u64, created_at_ms: u64) -> NewTask {
    NewTask {
        task_id: Uuid::new_v4(),
        user_id,
        kind: TaskKind::Generate,
        params: prompt("an owl in a library"),
        tokens_spent: cost,
        created_at_ms,
    }
}

#[tokio::test]
async fn insert_charged_deducts_and_persists_together() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 10).await;
    let repo = SqlxTaskRepository::new(pool.clone());
    let ledger = SqlxBalanceLedger::new(pool);

    let nt = new_task(1, 3, 5_000);
    let task = repo.insert_charged(&nt).await.unwrap().unwrap();

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(ledger.balance(1).await.unwrap(), Some(7));

    let stored = repo.fetch_by_id(&nt.task_id).await.unwrap().unwrap();
    assert_eq!(stored, task);
}

#[tokio::test]
async fn insert_charged_refused_leaves_no_trace() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 2).await;
    let repo = SqlxTaskRepository::new(pool.clone());
    let ledger = SqlxBalanceLedger::new(pool);

    let nt = new_task(1, 5, 5_000);
    assert!(repo.insert_charged(&nt).await.unwrap().is_none());

    assert!(repo.fetch_by_id(&nt.task_id).await.unwrap().is_none());
    assert_eq!(ledger.balance(1).await.unwrap(), Some(2));
}

#[tokio::test]
async fn edit_params_round_trip() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 10).await;
    let repo = SqlxTaskRepository::new(pool);

    let mut nt = new_task(1, 2, 5_000);
    nt.kind = TaskKind::Edit;
    nt.params = TaskParams::edit("add a hat", "file-abc");
    repo.insert_charged(&nt).await.unwrap();

    let t = repo.fetch_by_id(&nt.task_id).await.unwrap().unwrap();
    assert_eq!(t.kind, TaskKind::Edit);
    assert_eq!(t.params.source_image.as_deref(), Some("file-abc"));
}

#[tokio::test]
async fn status_writes_are_compare_and_set() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 10).await;
    let repo = SqlxTaskRepository::new(pool);

    let nt = new_task(1, 1, 5_000);
    repo.insert_charged(&nt).await.unwrap();
    let id = nt.task_id;

    // done requires processing first
    assert!(!repo.complete(&id, "https://x", 6_000).await.unwrap());

    assert!(repo.claim(&id, 6_000).await.unwrap());
    assert!(!repo.claim(&id, 6_001).await.unwrap(), "second claim must lose");

    assert!(repo.release_for_retry(&id, "502", 7_000).await.unwrap());
    let t = repo.fetch_by_id(&id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.retry_count, 1);
    assert_eq!(t.error_message.as_deref(), Some("502"));

    assert!(repo.claim(&id, 8_000).await.unwrap());
    assert!(repo.complete(&id, "https://cdn/1.png", 9_000).await.unwrap());

    let t = repo.fetch_by_id(&id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Done);
    assert_eq!(t.result_ref.as_deref(), Some("https://cdn/1.png"));
    assert_eq!(t.updated_at_ms, 9_000);

    // terminal
    assert!(!repo.claim(&id, 10_000).await.unwrap());
    assert_eq!(repo.fail_and_refund(&id, "late", 10_000).await.unwrap(), None);
}

#[tokio::test]
async fn fail_and_refund_credits_exactly_once() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 10).await;
    let repo = SqlxTaskRepository::new(pool.clone());
    let ledger = SqlxBalanceLedger::new(pool);

    let nt = new_task(1, 4, 5_000);
    repo.insert_charged(&nt).await.unwrap();
    repo.claim(&nt.task_id, 6_000).await.unwrap();
    assert_eq!(ledger.balance(1).await.unwrap(), Some(6));

    assert_eq!(
        repo.fail_and_refund(&nt.task_id, "boom", 7_000).await.unwrap(),
        Some(4)
    );
    assert_eq!(
        repo.fail_and_refund(&nt.task_id, "boom", 7_001).await.unwrap(),
        None
    );

    assert_eq!(ledger.balance(1).await.unwrap(), Some(10));

    let t = repo.fetch_by_id(&nt.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.refunded);
    assert_eq!(t.retry_count, 1, "failing out of processing burns the attempt");
}

#[tokio::test]
async fn refund_from_pending_keeps_retry_count_and_unknown_task_errors() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 10).await;
    let repo = SqlxTaskRepository::new(pool);

    let nt = new_task(1, 2, 5_000);
    repo.insert_charged(&nt).await.unwrap();

    assert_eq!(
        repo.fail_and_refund(&nt.task_id, "exhausted", 6_000).await.unwrap(),
        Some(2)
    );
    let t = repo.fetch_by_id(&nt.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.retry_count, 0);

    assert!(repo.fail_and_refund(&Uuid::new_v4(), "x", 6_000).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refunds_on_file_db_all_commit() {
    let (pool, _dir) = setup_file_db(16).await;
    seed_user(&pool, 1, 1_000).await;
    let repo = Arc::new(SqlxTaskRepository::new(pool.clone()));

    let mut ids = Vec::new();
    for i in 0..40 {
        let nt = new_task(1, 1, 5_000 + i);
        repo.insert_charged(&nt).await.unwrap().unwrap();
        assert!(repo.claim(&nt.task_id, 6_000).await.unwrap());
        ids.push(nt.task_id);
    }

    let ledger = SqlxBalanceLedger::new(pool);
    assert_eq!(ledger.balance(1).await.unwrap(), Some(960));

    let mut set = JoinSet::new();
    for id in ids.clone() {
        let r = repo.clone();
        set.spawn(async move { r.fail_and_refund(&id, "provider down", 7_000).await });
    }

    let mut refunded = 0;
    while let Some(res) = set.join_next().await {
        let out = res.unwrap().expect("refund must not fail under contention");
        assert_eq!(out, Some(1));
        refunded += 1;
    }

    assert_eq!(refunded, 40);
    assert_eq!(ledger.balance(1).await.unwrap(), Some(1_000));
    for id in &ids {
        let t = repo.fetch_by_id(id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.refunded);
    }
}

#[tokio::test]
async fn error_message_is_truncated() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 10).await;
    let repo = SqlxTaskRepository::new(pool);

    let nt = new_task(1, 1, 5_000);
    repo.insert_charged(&nt).await.unwrap();
    repo.fail_and_refund(&nt.task_id, &"e".repeat(2_000), 6_000)
        .await
        .unwrap();

    let t = repo.fetch_by_id(&nt.task_id).await.unwrap().unwrap();
    assert_eq!(t.error_message.unwrap().len(), 500);
}

#[tokio::test]
async fn window_count_history_and_outstanding_spend() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 100).await;
    seed_user(&pool, 2, 100).await;
    let repo = SqlxTaskRepository::new(pool);

    let mut ids = Vec::new();
    for (i, at) in [1_000u64, 2_000, 3_000].into_iter().enumerate() {
        let nt = new_task(1, (i as u64) + 1, at);
        ids.push(nt.task_id);
        repo.insert_charged(&nt).await.unwrap();
    }
    repo.insert_charged(&new_task(2, 1, 2_500)).await.unwrap();

    assert_eq!(repo.count_created_since(1, 2_000).await.unwrap(), 2);
    assert_eq!(repo.count_created_since(1, 0).await.unwrap(), 3);

    let hist = repo.history(1, 2).await.unwrap();
    assert_eq!(
        hist.iter().map(|t| t.task_id).collect::<Vec<_>>(),
        vec![ids[2], ids[1]],
        "most recent first"
    );

    assert_eq!(repo.outstanding_spend(1).await.unwrap(), 6);
    repo.fail_and_refund(&ids[2], "x", 4_000).await.unwrap();
    assert_eq!(repo.outstanding_spend(1).await.unwrap(), 3);
}

#[tokio::test]
async fn find_stale_filters_by_status_and_age() {
    let pool = setup_db().await;
    seed_user(&pool, 1, 100).await;
    let repo = SqlxTaskRepository::new(pool);

    let old = new_task(1, 1, 1_000);
    let fresh = new_task(1, 1, 50_000);
    let claimed = new_task(1, 1, 1_000);
    for nt in [&old, &fresh, &claimed] {
        repo.insert_charged(nt).await.unwrap();
    }
    repo.claim(&claimed.task_id, 2_000).await.unwrap();

    let pending = repo.find_stale(TaskStatus::Pending, 10_000, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, old.task_id);

    let processing = repo
        .find_stale(TaskStatus::Processing, 10_000, 10)
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].task_id, claimed.task_id);
}
