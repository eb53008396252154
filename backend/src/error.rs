use thiserror::Error;

use crate::task::model::TaskStatus;
use crate::user::model::UserId;

/// Invariant violations and infrastructure failures that abort the current operation.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("illegal task transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("numeric value out of range: {0}")]
    OutOfRange(String),
}

/// Why an admission was refused. Final for the call; the caller re-submits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("rate limit exceeded: at most {limit} tasks per {window_hours}h")]
    RateLimitExceeded { limit: u32, window_hours: u32 },

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Rejection {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::UserNotFound(_) => "user_not_found",
            Rejection::RateLimitExceeded { .. } => "rate_limit",
            Rejection::InsufficientBalance { .. } => "insufficient_balance",
            Rejection::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Text shown to the end user.
    pub fn user_text(&self) -> String {
        match self {
            Rejection::UserNotFound(_) => "User not found. Send /start first.".to_string(),
            Rejection::RateLimitExceeded { limit, window_hours } => format!(
                "Request limit reached: at most {limit} generations per {window_hours} hour(s). Try again later."
            ),
            Rejection::InsufficientBalance {
                required,
                available,
            } => format!(
                "Not enough tokens.\nRequired: {required}\nYour balance: {available}\nTop up your balance to continue."
            ),
            Rejection::InvalidRequest(reason) => format!("Request rejected: {reason}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Persistence(e.into())
    }
}
