//! Ledger error model.

use thiserror::Error;

use crate::id::UserId;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Failure kinds surfaced by ledger operations.
///
/// Every mutating operation that fails has already rolled back its transaction
/// by the time one of these is returned; no partial commit is observable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed or out-of-range input. Caller error, not retryable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The account is required to exist but has never been created.
    #[error("account {0} not found")]
    NotFound(UserId),

    /// Balance too low for the requested debit. Nothing was mutated.
    #[error("insufficient funds on account {user_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        user_id: UserId,
        balance: i64,
        requested: i64,
    },

    /// An internal invariant was violated (e.g. a create raced past the row lock).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation's deadline fired before it committed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Store or transport failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether re-running the whole operation may succeed.
    ///
    /// `Internal` is only safe to retry if the caller de-duplicates requests.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. } | Self::DeadlineExceeded | Self::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_funds_message_names_account_and_amounts() {
        let err = LedgerError::InsufficientFunds {
            user_id: UserId::new(7),
            balance: 10,
            requested: 20,
        };
        assert_eq!(
            err.to_string(),
            "insufficient funds on account 7: balance 10, requested 20"
        );
    }

    #[test]
    fn caller_errors_are_not_retryable() {
        assert!(!LedgerError::invalid_argument("x").is_retryable());
        assert!(!LedgerError::NotFound(UserId::new(1)).is_retryable());
        assert!(!LedgerError::conflict("x").is_retryable());
        assert!(LedgerError::DeadlineExceeded.is_retryable());
    }
}
