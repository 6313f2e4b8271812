//! Ledger Event Definitions
//!
//! Every balance or lifecycle change of an account is one immutable event.
//! Aggregate state is a fold over the account's ordered event stream.

use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, AssetId, CorrelationId, OwnerId, SeqNum};

/// Domain events for the account aggregate
///
/// Events are append-only: once written they are never modified. Corrections
/// are modeled as new compensating events, never as in-place edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Account created. Emitted exactly once per aggregate, at sequence 1.
    AccountOpened { owner: OwnerId },

    /// Funds added. Permitted on frozen accounts: freezing blocks outbound
    /// movement only, not inbound.
    Credited { asset: AssetId, amount: u64 },

    /// Funds removed. Rejected before append if it would take the balance
    /// negative or the account is frozen.
    Debited { asset: AssetId, amount: u64 },

    /// Outbound movement blocked until unfrozen
    AccountFrozen {
        reason: String,
        authorized_by: String,
    },

    /// Outbound movement re-enabled
    AccountUnfrozen {
        reason: String,
        authorized_by: String,
    },

    /// Account closed. Only permitted when every asset balance is exactly
    /// zero and the account is not frozen.
    AccountClosed,
}

impl LedgerEvent {
    /// Get the event type name for storage and logging
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::AccountOpened { .. } => "account_opened",
            LedgerEvent::Credited { .. } => "credited",
            LedgerEvent::Debited { .. } => "debited",
            LedgerEvent::AccountFrozen { .. } => "account_frozen",
            LedgerEvent::AccountUnfrozen { .. } => "account_unfrozen",
            LedgerEvent::AccountClosed => "account_closed",
        }
    }

    /// Signed balance delta this event contributes for the given asset
    pub fn signed_delta(&self, asset: AssetId) -> i64 {
        match self {
            LedgerEvent::Credited { asset: a, amount } if *a == asset => *amount as i64,
            LedgerEvent::Debited { asset: a, amount } if *a == asset => -(*amount as i64),
            _ => 0,
        }
    }
}

/// One persisted event: the aggregate's id, its position in the stream,
/// the typed payload, and the audit identifiers.
///
/// `sequence` is 1-based and contiguous per aggregate. Appends are
/// compare-and-append: an event at sequence N is only accepted if the
/// aggregate's current head is N-1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub aggregate_id: AccountId,
    pub sequence: SeqNum,
    pub event: LedgerEvent,
    /// Wall-clock timestamp (millis since epoch)
    pub timestamp_ms: i64,
    /// Links the events produced by one logical operation
    pub correlation_id: CorrelationId,
    /// The correlation of the operation that caused this one, if any
    pub causation_id: Option<CorrelationId>,
}

impl EventRecord {
    pub fn new(
        aggregate_id: AccountId,
        sequence: SeqNum,
        event: LedgerEvent,
        correlation_id: CorrelationId,
        causation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            aggregate_id,
            sequence,
            event,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            correlation_id,
            causation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        let e = LedgerEvent::Credited {
            asset: 1,
            amount: 100,
        };
        assert_eq!(e.kind(), "credited");
        assert_eq!(LedgerEvent::AccountClosed.kind(), "account_closed");
    }

    #[test]
    fn test_signed_delta() {
        let credit = LedgerEvent::Credited {
            asset: 1,
            amount: 100,
        };
        let debit = LedgerEvent::Debited {
            asset: 1,
            amount: 40,
        };

        assert_eq!(credit.signed_delta(1), 100);
        assert_eq!(debit.signed_delta(1), -40);
        // Other assets are unaffected
        assert_eq!(credit.signed_delta(2), 0);
        assert_eq!(debit.signed_delta(2), 0);
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let record = EventRecord::new(
            AccountId::new(),
            1,
            LedgerEvent::AccountFrozen {
                reason: "court order".to_string(),
                authorized_by: "ops:9913".to_string(),
            },
            CorrelationId::new(),
            None,
        );

        let json = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
