pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::model::{TaskKind, TaskParams};

pub use http::HttpImageProvider;

/// What a successful generation hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutput {
    /// Where the image lives (URL or provider file id).
    pub result_ref: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider call timed out after {0}s")]
    Timeout(u64),

    /// The provider answered and refused the request.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("provider transport error: {0}")]
    Transport(String),
}

/// External image generation service.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn execute(
        &self,
        kind: TaskKind,
        params: &TaskParams,
    ) -> Result<ProviderOutput, ProviderError>;
}
