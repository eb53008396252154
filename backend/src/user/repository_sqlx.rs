use anyhow::Context;
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use tracing::{debug, info, instrument};

use crate::db::{i64_to_u64, u64_to_i64};
use crate::task::model::{ImageQuality, ImageSize};
use crate::user::model::{NewUser, ProviderModel, User, UserId};
use crate::user::repository::UserRepository;

/// SQLx-backed user directory.
/// Responsible only for persistence and row mapping.
pub struct SqlxUserRepository {
    pool: AnyPool,
}

impl SqlxUserRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for SqlxUserRepository {
    #[instrument(skip(self), target = "store")]
    async fn fetch_by_id(&self, user_id: UserId) -> anyhow::Result<Option<User>> {
        let row = sqlx::query(
            r#"
SELECT user_id, username, first_name, tokens, selected_model, image_quality, image_size,
       created_at_ms, updated_at_ms
FROM users
WHERE user_id = ?;
"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_user(&r)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, new_user), target = "store", fields(user_id = new_user.user_id))]
    async fn get_or_create(
        &self,
        new_user: &NewUser,
        initial_tokens: u64,
        now_ms: u64,
    ) -> anyhow::Result<(User, bool)> {
        let now = u64_to_i64(now_ms)?;

        // Concurrent first contacts race on the primary key; exactly one insert wins.
        let res = sqlx::query(
            r#"
INSERT INTO users (user_id, username, first_name, tokens, selected_model, image_quality, image_size,
                   created_at_ms, updated_at_ms)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (user_id) DO NOTHING;
"#,
        )
        .bind(new_user.user_id)
        .bind(new_user.username.clone())
        .bind(new_user.first_name.clone())
        .bind(u64_to_i64(initial_tokens)?)
        .bind(ProviderModel::default().as_str())
        .bind(ImageQuality::default().to_string())
        .bind(ImageSize::default().to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let created = res.rows_affected() == 1;

        let user = self
            .fetch_by_id(new_user.user_id)
            .await?
            .with_context(|| format!("user {} vanished after upsert", new_user.user_id))?;

        if created {
            info!(tokens = user.tokens, "user created with initial grant");
        } else {
            debug!("existing user returned");
        }

        Ok((user, created))
    }

    async fn set_model(
        &self,
        user_id: UserId,
        model: ProviderModel,
        now_ms: u64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE users
SET selected_model = ?, updated_at_ms = ?
WHERE user_id = ?;
"#,
        )
        .bind(model.as_str())
        .bind(u64_to_i64(now_ms)?)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self), target = "store")]
    async fn set_image_settings(
        &self,
        user_id: UserId,
        quality: Option<ImageQuality>,
        size: Option<ImageSize>,
        now_ms: u64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE users
SET image_quality = COALESCE(?, image_quality),
    image_size = COALESCE(?, image_size),
    updated_at_ms = ?
WHERE user_id = ?;
"#,
        )
        .bind(quality.map(|q| q.to_string()))
        .bind(size.map(|s| s.to_string()))
        .bind(u64_to_i64(now_ms)?)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}

/* =========================
Row mapping
========================= */

pub(crate) fn row_to_user(r: &sqlx::any::AnyRow) -> anyhow::Result<User> {
    let model_str: String = r.get("selected_model");
    let quality_str: String = r.get("image_quality");
    let size_str: String = r.get("image_size");

    Ok(User {
        user_id: r.get::<i64, _>("user_id"),
        username: r.get::<Option<String>, _>("username"),
        first_name: r.get::<Option<String>, _>("first_name"),
        tokens: i64_to_u64(r.get("tokens"))?,
        selected_model: model_str.parse()?,
        image_quality: quality_str.parse()?,
        image_size: size_str.parse()?,
        created_at_ms: i64_to_u64(r.get("created_at_ms"))?,
        updated_at_ms: i64_to_u64(r.get("updated_at_ms"))?,
    })
}
