//! Transfer Error Types

use thiserror::Error;

use crate::ledger::LedgerError;

/// Transfer error types
///
/// Business-rule errors are returned synchronously with no retry; the
/// failed record always carries the originating error kind for audit.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Source and destination account cannot be the same")]
    SameAccount,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Source account not found")]
    SourceAccountNotFound,

    #[error("Destination account not found")]
    DestinationAccountNotFound,

    // === Ledger rejections (insufficient funds, frozen, conflicts) ===
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The credit leg failed AND the reversing credit failed too. Money is
    /// debited but not restored: fatal, escalated to manual operator
    /// intervention, never silently dropped.
    #[error("Compensation failed for transfer {transfer_id}: {detail}")]
    CompensationFailure {
        transfer_id: String,
        detail: String,
    },

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::SourceAccountNotFound => "SOURCE_ACCOUNT_NOT_FOUND",
            TransferError::DestinationAccountNotFound => "DESTINATION_ACCOUNT_NOT_FOUND",
            TransferError::Ledger(e) => e.code(),
            TransferError::CompensationFailure { .. } => "COMPENSATION_FAILURE",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
        }
    }
}
