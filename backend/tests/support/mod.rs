#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::AnyPool;
use tempfile::TempDir;
use uuid::Uuid;

use genqueue::db::Db;
use genqueue::delivery::{DeliveryChannel, Notification};
use genqueue::provider::{ImageProvider, ProviderError, ProviderOutput};
use genqueue::task::model::{TaskKind, TaskParams};
use genqueue::user::model::{NewUser, User, UserId};
use genqueue::user::repository::UserRepository;
use genqueue::user::repository_sqlx::SqlxUserRepository;

/// Isolated in-memory DB per test.
/// Unique name prevents test interference during parallel execution.
/// One connection: SQLite shared-cache tables lock per connection, and a
/// single connection serializes transactions the way a real server would.
pub async fn setup_db() -> AnyPool {
    let url = format!("sqlite:file:{}?mode=memory&cache=shared", Uuid::new_v4());
    let db = Db::connect_with(&url, 1)
        .await
        .expect("connect sqlite memory db");
    db.migrate().await.expect("migrate");
    db.pool
}

/// File-backed DB with a multi-connection pool, for tests that need real
/// SQLite write-lock contention. The directory is removed on drop.
pub async fn setup_file_db(max_connections: u32) -> (AnyPool, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("genqueue.db").display());
    let db = Db::connect_with(&url, max_connections)
        .await
        .expect("connect sqlite file db");
    db.migrate().await.expect("migrate");
    (db.pool, dir)
}

pub async fn seed_user(pool: &AnyPool, user_id: UserId, tokens: u64) -> User {
    let repo = SqlxUserRepository::new(pool.clone());
    let (user, created) = repo
        .get_or_create(
            &NewUser {
                user_id,
                username: Some(format!("user{user_id}")),
                first_name: None,
            },
            tokens,
            1_000,
        )
        .await
        .expect("seed user");
    assert!(created);
    user
}

pub fn prompt(text: &str) -> TaskParams {
    TaskParams::generate(text)
}

/// Replays scripted results, then succeeds.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ProviderOutput, ProviderError>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn failing(times: usize) -> Self {
        let script = (0..times)
            .map(|i| Err(ProviderError::Transport(format!("upstream 502 #{i}"))))
            .collect();
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
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
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| {
            Ok(ProviderOutput {
                result_ref: format!("https://cdn.test/{n}.png"),
            })
        })
    }
}

#[derive(Default)]
pub struct RecordingDelivery {
    pub sent: Mutex<Vec<(UserId, Notification)>>,
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn notify(&self, user_id: UserId, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().push((user_id, notification.clone()));
        Ok(())
    }
}
