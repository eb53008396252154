use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::provider::{ImageProvider, ProviderError, ProviderOutput};
use crate::task::model::{ImageQuality, ImageSize, TaskKind, TaskParams};

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    kind: TaskKind,
    prompt: &'a str,
    quality: ImageQuality,
    size: ImageSize,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_image: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    url: Option<String>,
    error: Option<String>,
}

/// JSON-over-HTTP image provider.
pub struct HttpImageProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpImageProvider {
    /// `timeout` bounds the HTTP exchange itself; the executor applies its own
    /// deadline on top.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    #[instrument(skip(self, params), target = "executor", fields(model = %params.model))]
    async fn execute(
        &self,
        kind: TaskKind,
        params: &TaskParams,
    ) -> Result<ProviderOutput, ProviderError> {
        let body = ImageRequest {
            model: params.model.as_str(),
            kind,
            prompt: &params.prompt,
            quality: params.quality,
            size: params.size,
            source_image: params.source_image.as_deref(),
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        debug!(%status, bytes = text.len(), "provider responded");
        parse_response(status.as_u16(), &text)
    }
}

/// Maps a provider reply onto the outcome. 5xx is transport trouble, other
/// non-2xx or an `error` field is a refusal.
fn parse_response(status: u16, body: &str) -> Result<ProviderOutput, ProviderError> {
    let parsed: Option<ImageResponse> = serde_json::from_str(body).ok();

    if !(200..300).contains(&status) {
        let detail = parsed
            .and_then(|r| r.error)
            .unwrap_or_else(|| format!("http {status}"));
        return Err(if status >= 500 {
            ProviderError::Transport(detail)
        } else {
            ProviderError::Rejected(detail)
        });
    }

    match parsed {
        Some(ImageResponse {
            error: Some(err), ..
        }) => Err(ProviderError::Rejected(err)),
        Some(ImageResponse {
            url: Some(url), ..
        }) if !url.is_empty() => Ok(ProviderOutput { result_ref: url }),
        _ => Err(ProviderError::Transport(
            "malformed provider response".to_string(),
        )),
    }
}
