//! Balance ledger: the only code that mutates `users.tokens`.
//!
//! Every mutation is a single guarded `UPDATE`, never a read-then-write on the
//! caller's side. The `*_in` primitives take a connection so other units of
//! work (admission, refund) can apply them inside their own transaction.

pub mod ledger_sqlx;

use async_trait::async_trait;
use sqlx::AnyConnection;
use sqlx::Row;

use crate::db::{i64_to_u64, u64_to_i64};
use crate::error::LedgerError;
use crate::user::model::UserId;

#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Current balance, `None` if the user does not exist.
    async fn balance(&self, user_id: UserId) -> Result<Option<u64>, LedgerError>;

    /// Atomically removes `amount`. Fails without side effects when the
    /// balance is short. Returns the new balance.
    async fn deduct(&self, user_id: UserId, amount: u64) -> Result<u64, LedgerError>;

    /// Atomically adds `amount`. No upper bound. Returns the new balance.
    async fn credit(&self, user_id: UserId, amount: u64) -> Result<u64, LedgerError>;
}

/// Guarded decrement. `false` when the user is missing or cannot cover `amount`.
pub(crate) async fn deduct_in(
    conn: &mut AnyConnection,
    user_id: UserId,
    amount: u64,
    now_ms: u64,
) -> anyhow::Result<bool> {
    let amount = u64_to_i64(amount)?;

    let res = sqlx::query(
        r#"
UPDATE users
SET tokens = tokens - ?, updated_at_ms = ?
WHERE user_id = ? AND tokens >= ?;
"#,
    )
    .bind(amount)
    .bind(u64_to_i64(now_ms)?)
    .bind(user_id)
    .bind(amount)
    .execute(&mut *conn)
    .await?;

    Ok(res.rows_affected() == 1)
}

/// Unconditional increment. `false` when the user is missing.
pub(crate) async fn credit_in(
    conn: &mut AnyConnection,
    user_id: UserId,
    amount: u64,
    now_ms: u64,
) -> anyhow::Result<bool> {
    let res = sqlx::query(
        r#"
UPDATE users
SET tokens = tokens + ?, updated_at_ms = ?
WHERE user_id = ?;
"#,
    )
    .bind(u64_to_i64(amount)?)
    .bind(u64_to_i64(now_ms)?)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(res.rows_affected() == 1)
}

pub(crate) async fn balance_in(
    conn: &mut AnyConnection,
    user_id: UserId,
) -> anyhow::Result<Option<u64>> {
    let row = sqlx::query("SELECT tokens FROM users WHERE user_id = ?;")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(r) => Ok(Some(i64_to_u64(r.get("tokens"))?)),
        None => Ok(None),
    }
}
