//! Ledger error taxonomy
//!
//! Every ledger-affecting operation returns `Result<_, LedgerError>`. The HTTP
//! layer maps variants to status codes via [`LedgerError::status_code`].

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },

    #[error("Account {0} not found")]
    AccountNotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Scenario {0} already resolved")]
    AlreadyResolved(String),

    #[error("Reward {0} already claimed")]
    AlreadyClaimed(String),

    #[error("Reward {0} not completed")]
    RewardNotCompleted(String),

    #[error("Stock exhausted for item {item_id}: requested {requested}, available {available}")]
    StockExhausted {
        item_id: String,
        requested: i64,
        available: i64,
    },

    #[error("Per-user limit exceeded for item {item_id}: owned {owned}, requested {requested}, max {max}")]
    LimitExceeded {
        item_id: String,
        owned: i64,
        requested: i64,
        max: i64,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::AlreadyResolved(_) => "ALREADY_RESOLVED",
            Self::AlreadyClaimed(_) => "ALREADY_CLAIMED",
            Self::RewardNotCompleted(_) => "REWARD_NOT_COMPLETED",
            Self::StockExhausted { .. } => "STOCK_EXHAUSTED",
            Self::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::AccountNotFound(_) | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyResolved(_)
            | Self::AlreadyClaimed(_)
            | Self::InvalidTransition { .. }
            | Self::StockExhausted { .. }
            | Self::LimitExceeded { .. } => StatusCode::CONFLICT,
            Self::InvalidAmount(_) | Self::RewardNotCompleted(_) | Self::ValidationError(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only storage failures are worth retrying; every ledger operation is
    /// idempotent under retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InternalError(_))
    }

    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. }
                | Self::InvalidAmount(_)
                | Self::StockExhausted { .. }
                | Self::LimitExceeded { .. }
                | Self::RewardNotCompleted(_)
                | Self::ValidationError(_)
        )
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::InternalError(err.to_string())
    }
}

impl From<anyhow::Error> for LedgerError {
    fn from(err: anyhow::Error) -> Self {
        LedgerError::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::InternalError(format!("metadata encoding: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_status() {
        let err = LedgerError::InsufficientFunds {
            balance: 100,
            required: 200,
        };
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert!(err.is_user_error());
        assert!(!err.is_retryable());

        let err = LedgerError::AlreadyResolved("s1".into());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err = LedgerError::AccountNotFound("u1".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = LedgerError::InternalError("disk full".into());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_retryable());
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_error_display() {
        let err = LedgerError::not_found("scenario", "abc");
        assert_eq!(err.to_string(), "scenario abc not found");

        let err = LedgerError::LimitExceeded {
            item_id: "hat".into(),
            owned: 1,
            requested: 1,
            max: 1,
        };
        assert_eq!(
            err.to_string(),
            "Per-user limit exceeded for item hat: owned 1, requested 1, max 1"
        );
    }
}
