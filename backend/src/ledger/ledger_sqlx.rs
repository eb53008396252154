use async_trait::async_trait;
use sqlx::AnyPool;
use tracing::{debug, instrument, warn};

use crate::error::LedgerError;
use crate::ledger::{BalanceLedger, balance_in, credit_in, deduct_in};
use crate::time::now_ms;
use crate::user::model::UserId;

pub struct SqlxBalanceLedger {
    pool: AnyPool,
}

impl SqlxBalanceLedger {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BalanceLedger for SqlxBalanceLedger {
    async fn balance(&self, user_id: UserId) -> Result<Option<u64>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        Ok(balance_in(&mut conn, user_id).await?)
    }

    #[instrument(skip(self), target = "ledger")]
    async fn deduct(&self, user_id: UserId, amount: u64) -> Result<u64, LedgerError> {
        let mut tx = self.pool.begin().await?;

        if !deduct_in(&mut tx, user_id, amount, now_ms()).await? {
            let available = balance_in(&mut tx, user_id).await?;
            tx.rollback().await?;

            return Err(match available {
                None => LedgerError::UserNotFound(user_id),
                Some(available) => {
                    warn!(available, "deduction refused");
                    LedgerError::InsufficientBalance {
                        required: amount,
                        available,
                    }
                }
            });
        }

        let balance = balance_in(&mut tx, user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))?;
        tx.commit().await?;

        debug!(balance, "tokens deducted");
        Ok(balance)
    }

    #[instrument(skip(self), target = "ledger")]
    async fn credit(&self, user_id: UserId, amount: u64) -> Result<u64, LedgerError> {
        let mut tx = self.pool.begin().await?;

        if !credit_in(&mut tx, user_id, amount, now_ms()).await? {
            tx.rollback().await?;
            return Err(LedgerError::UserNotFound(user_id));
        }

        let balance = balance_in(&mut tx, user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))?;
        tx.commit().await?;

        debug!(balance, "tokens credited");
        Ok(balance)
    }
}
