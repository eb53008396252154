use anyhow::Result;
use async_trait::async_trait;

use crate::task::model::{ImageQuality, ImageSize};
use crate::user::model::{NewUser, ProviderModel, User, UserId};

/// User directory. Never mutates balances; that belongs to the ledger.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn fetch_by_id(&self, user_id: UserId) -> Result<Option<User>>;

    /// Returns the user, creating it with `initial_tokens` on first contact.
    /// The flag is `true` when this call created the row.
    async fn get_or_create(
        &self,
        new_user: &NewUser,
        initial_tokens: u64,
        now_ms: u64,
    ) -> Result<(User, bool)>;

    async fn set_model(&self, user_id: UserId, model: ProviderModel, now_ms: u64) -> Result<bool>;

    /// Updates the stored image defaults; `None` leaves a field unchanged.
    /// Returns `false` when the user does not exist.
    async fn set_image_settings(
        &self,
        user_id: UserId,
        quality: Option<ImageQuality>,
        size: Option<ImageSize>,
        now_ms: u64,
    ) -> Result<bool>;
}
