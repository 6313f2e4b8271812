//! Balance Projection Store
//!
//! Materialized per-account-per-asset balances derived from the event log.
//! The projection is a pure, replayable function of the events: its value
//! for (account, asset) always equals the sum of signed amounts of all
//! applied events for that pair. It is never an independent source of
//! truth, and it is never mutated directly - corrections are new events.

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use super::error::LedgerError;
use super::event::{EventRecord, LedgerEvent};
use crate::core_types::{AccountId, AssetId, SeqNum};

#[derive(Debug, Default)]
struct AccountBalances {
    balances: FxHashMap<AssetId, u64>,
    /// Highest sequence folded in. Re-applying an already-applied event is
    /// a no-op; skipping ahead is corruption and is rejected.
    last_applied: SeqNum,
}

impl AccountBalances {
    fn fold(&mut self, record: &EventRecord) -> Result<(), LedgerError> {
        match &record.event {
            LedgerEvent::Credited { asset, amount } => {
                let entry = self.balances.entry(*asset).or_insert(0);
                *entry = entry.checked_add(*amount).ok_or(LedgerError::Overflow)?;
            }
            LedgerEvent::Debited { asset, amount } => {
                let entry = self.balances.entry(*asset).or_insert(0);
                *entry = entry.checked_sub(*amount).ok_or_else(|| {
                    LedgerError::Storage(format!(
                        "projection underflow: asset {} at sequence {}",
                        asset, record.sequence
                    ))
                })?;
            }
            // Lifecycle events carry no balance delta
            _ => {}
        }
        self.last_applied = record.sequence;
        Ok(())
    }
}

/// Read-optimized balance view, keyed per account.
///
/// Applied synchronously with the append that produced the event, so a
/// single process always reads its own writes.
#[derive(Debug, Default)]
pub struct BalanceProjection {
    accounts: DashMap<AccountId, AccountBalances>,
}

impl BalanceProjection {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    /// Fold one event into the projection.
    ///
    /// Idempotent per sequence: an event at or below `last_applied` is
    /// skipped. A gap (sequence beyond `last_applied + 1`) means events
    /// were lost between append and apply and is surfaced as corruption.
    pub fn apply(&self, record: &EventRecord) -> Result<(), LedgerError> {
        let mut entry = self.accounts.entry(record.aggregate_id).or_default();

        if record.sequence <= entry.last_applied {
            return Ok(());
        }
        if record.sequence != entry.last_applied + 1 {
            return Err(LedgerError::Storage(format!(
                "projection gap: expected sequence {}, got {}",
                entry.last_applied + 1,
                record.sequence
            )));
        }

        entry.fold(record)
    }

    /// Current projected balance for (account, asset); 0 when unknown
    pub fn balance_of(&self, account: AccountId, asset: AssetId) -> u64 {
        self.accounts
            .get(&account)
            .and_then(|e| e.balances.get(&asset).copied())
            .unwrap_or(0)
    }

    /// All non-zero balances of an account
    pub fn balances(&self, account: AccountId) -> FxHashMap<AssetId, u64> {
        self.accounts
            .get(&account)
            .map(|e| {
                e.balances
                    .iter()
                    .filter(|(_, v)| **v > 0)
                    .map(|(k, v)| (*k, *v))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest sequence applied for the account (0 if none)
    pub fn last_applied(&self, account: AccountId) -> SeqNum {
        self.accounts
            .get(&account)
            .map(|e| e.last_applied)
            .unwrap_or(0)
    }

    /// Replay an account's projection from scratch.
    ///
    /// Discards the incrementally maintained value and folds the given full
    /// event history. Used for audit and recovery; the result must be
    /// bit-identical to the incremental value.
    pub fn rebuild(
        &self,
        account: AccountId,
        history: &[EventRecord],
    ) -> Result<(), LedgerError> {
        let mut fresh = AccountBalances::default();
        for record in history {
            if record.aggregate_id != account {
                return Err(LedgerError::Storage(format!(
                    "rebuild fed event for foreign aggregate {}",
                    record.aggregate_id
                )));
            }
            if record.sequence != fresh.last_applied + 1 {
                return Err(LedgerError::Storage(format!(
                    "rebuild gap: expected sequence {}, got {}",
                    fresh.last_applied + 1,
                    record.sequence
                )));
            }
            fresh.fold(record)?;
        }

        self.accounts.insert(account, fresh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::CorrelationId;

    fn credit(id: AccountId, seq: SeqNum, asset: AssetId, amount: u64) -> EventRecord {
        EventRecord::new(
            id,
            seq,
            LedgerEvent::Credited { asset, amount },
            CorrelationId::new(),
            None,
        )
    }

    fn debit(id: AccountId, seq: SeqNum, asset: AssetId, amount: u64) -> EventRecord {
        EventRecord::new(
            id,
            seq,
            LedgerEvent::Debited { asset, amount },
            CorrelationId::new(),
            None,
        )
    }

    #[test]
    fn test_apply_and_read() {
        let projection = BalanceProjection::new();
        let id = AccountId::new();

        projection.apply(&credit(id, 1, 1, 1000)).unwrap();
        projection.apply(&debit(id, 2, 1, 300)).unwrap();
        projection.apply(&credit(id, 3, 2, 50)).unwrap();

        assert_eq!(projection.balance_of(id, 1), 700);
        assert_eq!(projection.balance_of(id, 2), 50);
        assert_eq!(projection.balance_of(id, 99), 0);
        assert_eq!(projection.last_applied(id), 3);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let projection = BalanceProjection::new();
        let id = AccountId::new();

        let e = credit(id, 1, 1, 500);
        projection.apply(&e).unwrap();
        projection.apply(&e).unwrap(); // re-delivery, no double credit
        assert_eq!(projection.balance_of(id, 1), 500);
    }

    #[test]
    fn test_apply_gap_rejected() {
        let projection = BalanceProjection::new();
        let id = AccountId::new();

        projection.apply(&credit(id, 1, 1, 100)).unwrap();
        let err = projection.apply(&credit(id, 3, 1, 100)).unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
    }

    #[test]
    fn test_underflow_is_corruption() {
        let projection = BalanceProjection::new();
        let id = AccountId::new();

        projection.apply(&credit(id, 1, 1, 100)).unwrap();
        let err = projection.apply(&debit(id, 2, 1, 200)).unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let projection = BalanceProjection::new();
        let id = AccountId::new();

        let history = vec![
            credit(id, 1, 1, 1000),
            debit(id, 2, 1, 250),
            credit(id, 3, 1, 10),
            debit(id, 4, 1, 760),
        ];
        for e in &history {
            projection.apply(e).unwrap();
        }
        let incremental = projection.balance_of(id, 1);

        projection.rebuild(id, &history).unwrap();
        assert_eq!(projection.balance_of(id, 1), incremental);
        assert_eq!(incremental, 0);
    }

    #[test]
    fn test_balances_filters_zero() {
        let projection = BalanceProjection::new();
        let id = AccountId::new();

        projection.apply(&credit(id, 1, 1, 100)).unwrap();
        projection.apply(&credit(id, 2, 2, 40)).unwrap();
        projection.apply(&debit(id, 3, 2, 40)).unwrap();

        let balances = projection.balances(id);
        assert_eq!(balances.len(), 1);
        assert_eq!(balances.get(&1), Some(&100));
    }
}
