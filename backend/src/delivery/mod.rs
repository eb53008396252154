//! Outbound user notifications.
//!
//! Fire-and-forget from the core's point of view: callers log a failed
//! `notify` and move on, nothing here is retried.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument};

use crate::task::model::{TaskId, TaskKind};
use crate::user::model::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Result {
        task_id: TaskId,
        kind: TaskKind,
        prompt: String,
        result_ref: String,
    },
    Failure {
        task_id: TaskId,
        refunded_tokens: u64,
    },
}

impl Notification {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Notification::Result { task_id, .. } | Notification::Failure { task_id, .. } => task_id,
        }
    }

    pub fn render_text(&self) -> String {
        match self {
            Notification::Result {
                kind,
                prompt,
                result_ref,
                ..
            } => {
                let verb = match kind {
                    TaskKind::Generate => "generated",
                    TaskKind::Edit => "edited",
                };
                format!("Your image is {verb}.\nPrompt: {prompt}\n{result_ref}")
            }
            Notification::Failure {
                refunded_tokens, ..
            } => format!(
                "Generation failed. {refunded_tokens} token(s) have been returned to your balance."
            ),
        }
    }
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn notify(&self, user_id: UserId, notification: &Notification) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    user_id: UserId,
    text: String,
    #[serde(flatten)]
    notification: &'a Notification,
}

/// POSTs each notification as JSON to a front-end webhook.
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl DeliveryChannel for WebhookDelivery {
    #[instrument(skip(self, notification), target = "executor", fields(task_id = %notification.task_id()))]
    async fn notify(&self, user_id: UserId, notification: &Notification) -> anyhow::Result<()> {
        let payload = WebhookPayload {
            user_id,
            text: notification.render_text(),
            notification,
        };

        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
pub struct LogDelivery;

#[async_trait]
impl DeliveryChannel for LogDelivery {
    async fn notify(&self, user_id: UserId, notification: &Notification) -> anyhow::Result<()> {
        info!(
            target: "delivery",
            user_id,
            task_id = %notification.task_id(),
            text = %notification.render_text(),
            "notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn failure_text_mentions_refund() {
        let n = Notification::Failure {
            task_id: Uuid::new_v4(),
            refunded_tokens: 3,
        };
        assert!(n.render_text().contains("3 token(s) have been returned"));
    }

    #[test]
    fn webhook_payload_is_flat_and_tagged() {
        let task_id = Uuid::new_v4();
        let n = Notification::Result {
            task_id,
            kind: TaskKind::Edit,
            prompt: "make it blue".into(),
            result_ref: "https://cdn/y.png".into(),
        };
        let v = serde_json::to_value(WebhookPayload {
            user_id: 42,
            text: n.render_text(),
            notification: &n,
        })
        .unwrap();

        assert_eq!(v["type"], "result");
        assert_eq!(v["user_id"], 42);
        assert_eq!(v["kind"], "edit");
        assert_eq!(v["task_id"], task_id.to_string());
        assert!(v["text"].as_str().unwrap().contains("edited"));
    }
}
