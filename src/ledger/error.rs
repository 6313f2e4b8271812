//! Ledger Error Types

use thiserror::Error;

use crate::core_types::SeqNum;

/// Ledger error types
///
/// Business-rule errors are returned synchronously to the caller with no
/// retry. `SequenceConflict` is retried internally (reload and re-validate)
/// up to a bound, then surfaced as `ConcurrencyConflict`.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account is closed")]
    AccountClosed,

    #[error("Account is frozen")]
    AccountFrozen,

    #[error("Account is already frozen")]
    AlreadyFrozen,

    #[error("Account is not frozen")]
    NotFrozen,

    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: u64, requested: u64 },

    #[error("Account has a non-zero balance")]
    NonZeroBalance,

    // === Concurrency ===
    #[error("Sequence conflict: expected head {expected}, found {found}")]
    SequenceConflict { expected: SeqNum, found: SeqNum },

    #[error("Concurrency conflict: retries exhausted")]
    ConcurrencyConflict,

    // === Storage / Integrity ===
    #[error("Balance overflow")]
    Overflow,

    #[error("Archival requires a covering snapshot")]
    SnapshotMissing,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::AccountClosed => "ACCOUNT_CLOSED",
            LedgerError::AccountFrozen => "ACCOUNT_FROZEN",
            LedgerError::AlreadyFrozen => "ALREADY_FROZEN",
            LedgerError::NotFrozen => "NOT_FROZEN",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::NonZeroBalance => "NON_ZERO_BALANCE",
            LedgerError::SequenceConflict { .. } => "SEQUENCE_CONFLICT",
            LedgerError::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            LedgerError::Overflow => "OVERFLOW",
            LedgerError::SnapshotMissing => "SNAPSHOT_MISSING",
            LedgerError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether the caller may retry the whole operation after a reload
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::SequenceConflict { .. })
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for LedgerError {
    fn from(e: anyhow::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}
