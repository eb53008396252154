use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::task::model::{ImageQuality, ImageSize};

/// Opaque numeric identity supplied by the messaging front-end.
pub type UserId = i64;

/// Image model a user has selected for new tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProviderModel {
    #[default]
    #[serde(rename = "gpt-image-1")]
    GptImage1,
    #[serde(rename = "dall-e-3")]
    DallE3,
    #[serde(rename = "dall-e-2")]
    DallE2,
}

impl ProviderModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderModel::GptImage1 => "gpt-image-1",
            ProviderModel::DallE3 => "dall-e-3",
            ProviderModel::DallE2 => "dall-e-2",
        }
    }
}

impl fmt::Display for ProviderModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderModel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpt-image-1" => Ok(ProviderModel::GptImage1),
            "dall-e-3" => Ok(ProviderModel::DallE3),
            "dall-e-2" => Ok(ProviderModel::DallE2),
            other => Err(anyhow::anyhow!("Invalid ProviderModel value: {}", other)),
        }
    }
}

/// A user of the service.
///
/// `tokens` is only ever changed through the balance ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub tokens: u64,
    pub selected_model: ProviderModel,
    /// Defaults applied to new requests that do not pick their own.
    pub image_quality: ImageQuality,
    pub image_size: ImageSize,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl User {
    pub fn can_afford(&self, cost: u64) -> bool {
        self.tokens >= cost
    }
}

/// Profile fields captured on first contact.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_round_trips_through_its_name() {
        for m in [
            ProviderModel::GptImage1,
            ProviderModel::DallE3,
            ProviderModel::DallE2,
        ] {
            assert_eq!(m.to_string().parse::<ProviderModel>().unwrap(), m);
        }
        assert!("midjourney".parse::<ProviderModel>().is_err());
    }

    #[test]
    fn default_model_is_gpt_image_1() {
        assert_eq!(ProviderModel::default().as_str(), "gpt-image-1");
    }

    #[test]
    fn can_afford_is_inclusive() {
        let u = User {
            user_id: 1,
            username: None,
            first_name: None,
            tokens: 5,
            selected_model: ProviderModel::default(),
            image_quality: ImageQuality::default(),
            image_size: ImageSize::default(),
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        assert!(u.can_afford(5));
        assert!(!u.can_afford(6));
    }
}
