//! Transfer Status Definitions
//!
//! Status IDs are designed for SMALLINT storage.

use std::fmt;

/// Caller-visible transfer lifecycle.
///
/// Callers never see partial-money-movement states: a transfer is
/// `Pending`, `Settled` or `Failed`, never "debited but not credited".
/// Terminal states: SETTLED (10), FAILED (-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum TransferStatus {
    /// Saga in progress
    Pending = 0,

    /// Terminal: both legs appended, funds moved
    Settled = 10,

    /// Terminal: debit rejected, or credit failed and the debit was
    /// compensated
    Failed = -10,
}

impl TransferStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Settled | TransferStatus::Failed)
    }

    /// Get the numeric status ID for storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from a storage status ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferStatus::Pending),
            10 => Some(TransferStatus::Settled),
            -10 => Some(TransferStatus::Failed),
            _ => None,
        }
    }

    /// Get human-readable status name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Settled => "SETTLED",
            TransferStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferStatus::from_id(value).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TransferStatus::Settled.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_id_roundtrip() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::Settled,
            TransferStatus::Failed,
        ] {
            assert_eq!(TransferStatus::from_id(status.id()), Some(status));
        }
        assert!(TransferStatus::from_id(99).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransferStatus::Pending.to_string(), "PENDING");
        assert_eq!(TransferStatus::Settled.to_string(), "SETTLED");
        assert_eq!(TransferStatus::Failed.to_string(), "FAILED");
    }
}
