use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::user::model::{ProviderModel, UserId};

pub type TaskId = Uuid;

pub const MAX_PROMPT_CHARS: usize = 2_000;
pub const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Generate,
    Edit,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Generate => "generate",
            TaskKind::Edit => "edit",
        })
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(TaskKind::Generate),
            "edit" => Ok(TaskKind::Edit),
            other => Err(anyhow::anyhow!("Invalid TaskKind value: {}", other)),
        }
    }
}

/// Lifecycle of a generation task.
///
/// ```text
/// pending ──► processing ──► done
///    ▲            │
///    └────────────┤ (released for retry)
///    │            ▼
///    └───────►  failed      (pending -> failed only when the retry budget is gone)
/// ```
///
/// `done` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Exhaustive transition table.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Done) => true,
            (Processing, Failed) => true,
            (Processing, Pending) => true,
            (Pending, Failed) => true,
            (Pending, Pending)
            | (Pending, Done)
            | (Processing, Processing)
            | (Done, _)
            | (Failed, _) => false,
        }
    }

    pub fn ensure_transition(self, next: TaskStatus) -> Result<(), AppError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(anyhow::anyhow!("Invalid TaskStatus value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for ImageQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageQuality::Low => "low",
            ImageQuality::Medium => "medium",
            ImageQuality::High => "high",
        })
    }
}

impl FromStr for ImageQuality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ImageQuality::Low),
            "medium" => Ok(ImageQuality::Medium),
            "high" => Ok(ImageQuality::High),
            other => Err(anyhow::anyhow!("Invalid ImageQuality value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageSize {
    #[default]
    #[serde(rename = "1024x1024")]
    Square,
    #[serde(rename = "1024x1536")]
    Portrait,
    #[serde(rename = "1536x1024")]
    Landscape,
}

impl ImageSize {
    pub fn is_square(self) -> bool {
        self == ImageSize::Square
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageSize::Square => "1024x1024",
            ImageSize::Portrait => "1024x1536",
            ImageSize::Landscape => "1536x1024",
        })
    }
}

impl FromStr for ImageSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1024x1024" => Ok(ImageSize::Square),
            "1024x1536" => Ok(ImageSize::Portrait),
            "1536x1024" => Ok(ImageSize::Landscape),
            other => Err(anyhow::anyhow!("Invalid ImageSize value: {}", other)),
        }
    }
}

/// What the user asked for. Sent verbatim to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    pub prompt: String,
    pub quality: ImageQuality,
    pub size: ImageSize,
    pub model: ProviderModel,
    /// Source image reference (URL or front-end file id); edits only.
    pub source_image: Option<String>,
}

impl TaskParams {
    pub fn generate(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            quality: ImageQuality::default(),
            size: ImageSize::default(),
            model: ProviderModel::default(),
            source_image: None,
        }
    }

    pub fn edit(prompt: impl Into<String>, source_image: impl Into<String>) -> Self {
        Self {
            source_image: Some(source_image.into()),
            ..Self::generate(prompt)
        }
    }

    /// Shape checks that do not need the store.
    pub fn validate(&self, kind: TaskKind) -> Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("prompt is empty".into());
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(format!("prompt exceeds {MAX_PROMPT_CHARS} characters"));
        }
        match (kind, self.source_image.as_deref()) {
            (TaskKind::Edit, None) => Err("edit requires a source image".into()),
            (TaskKind::Edit, Some(src)) if src.trim().is_empty() => {
                Err("edit requires a source image".into())
            }
            (TaskKind::Generate, Some(_)) => Err("generate does not take a source image".into()),
            _ => Ok(()),
        }
    }
}

/// Insert payload for a task that is being charged right now.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub kind: TaskKind,
    pub params: TaskParams,
    pub tokens_spent: u64,
    pub created_at_ms: u64,
}

/// Persisted generation task.
///
/// `tokens_spent` is fixed at creation and is exactly what a refund returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationTask {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub kind: TaskKind,
    pub params: TaskParams,
    pub status: TaskStatus,
    pub tokens_spent: u64,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub result_ref: Option<String>,
    pub refunded: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Cuts `s` to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
