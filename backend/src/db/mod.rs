pub mod schema;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

use crate::error::AppError;

#[derive(Clone)]
pub struct Db {
    pub pool: AnyPool,
}

impl Db {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        Self::connect_with(database_url, 16).await
    }

    pub async fn connect_with(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }
}

/* =========================
Numeric safety helpers
========================= */

pub(crate) fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    if v < 0 {
        return Err(AppError::OutOfRange(format!("negative i64 where u64 expected: {v}")).into());
    }
    Ok(v as u64)
}

pub(crate) fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(AppError::OutOfRange(format!("u64 too large for i64: {v}")).into());
    }
    Ok(v as i64)
}

pub(crate) fn i64_to_u32(v: i64) -> anyhow::Result<u32> {
    if v < 0 || v > u32::MAX as i64 {
        return Err(AppError::OutOfRange(format!("out of range for u32: {v}")).into());
    }
    Ok(v as u32)
}
