//! Account Ledger Aggregate
//!
//! Event-sourced account state and the mutation service around it. Every
//! mutating operation is optimistic-concurrency append-and-apply: load the
//! current state, validate the business rule, append at `sequence + 1`,
//! fold into the projection. A conflicting concurrent append forces the
//! whole operation to be retried from reload, up to a bound.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::error::LedgerError;
use super::event::{EventRecord, LedgerEvent};
use super::projection::BalanceProjection;
use super::store::{BalanceSnapshot, EventStore};
use crate::config::LedgerConfig;
use crate::core_types::{AccountId, AssetId, CorrelationId, OwnerId, SeqNum};

/// Aggregate state: a fold over the account's ordered event stream.
///
/// `Active <-> Frozen` is orthogonal to balance state; `closed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub id: AccountId,
    pub owner: OwnerId,
    pub frozen: bool,
    pub closed: bool,
    pub opened_at_ms: i64,
    pub balances: FxHashMap<AssetId, u64>,
    pub sequence: SeqNum,
}

impl AccountState {
    /// Reconstruct state from a snapshot
    pub fn from_snapshot(snapshot: &BalanceSnapshot) -> Self {
        Self {
            id: snapshot.aggregate_id,
            owner: snapshot.owner,
            frozen: snapshot.frozen,
            closed: snapshot.closed,
            opened_at_ms: snapshot.opened_at_ms,
            balances: snapshot.balances.iter().map(|(k, v)| (*k, *v)).collect(),
            sequence: snapshot.sequence,
        }
    }

    /// Replay a full event history (must start with `AccountOpened`)
    pub fn replay(history: &[EventRecord]) -> Result<Self, LedgerError> {
        let first = history
            .first()
            .ok_or_else(|| LedgerError::AccountNotFound("empty stream".to_string()))?;

        let LedgerEvent::AccountOpened { owner } = &first.event else {
            return Err(LedgerError::Storage(format!(
                "stream of {} does not start with account_opened",
                first.aggregate_id
            )));
        };

        let mut state = Self {
            id: first.aggregate_id,
            owner: *owner,
            frozen: false,
            closed: false,
            opened_at_ms: first.timestamp_ms,
            balances: FxHashMap::default(),
            sequence: first.sequence,
        };

        for record in &history[1..] {
            state.apply(record)?;
        }
        Ok(state)
    }

    /// Fold one event into the state
    pub fn apply(&mut self, record: &EventRecord) -> Result<(), LedgerError> {
        if record.sequence != self.sequence + 1 {
            return Err(LedgerError::Storage(format!(
                "fold gap: expected sequence {}, got {}",
                self.sequence + 1,
                record.sequence
            )));
        }

        match &record.event {
            LedgerEvent::AccountOpened { .. } => {
                return Err(LedgerError::Storage(
                    "account_opened after sequence 1".to_string(),
                ));
            }
            LedgerEvent::Credited { asset, amount } => {
                let entry = self.balances.entry(*asset).or_insert(0);
                *entry = entry.checked_add(*amount).ok_or(LedgerError::Overflow)?;
            }
            LedgerEvent::Debited { asset, amount } => {
                let entry = self.balances.entry(*asset).or_insert(0);
                *entry = entry.checked_sub(*amount).ok_or_else(|| {
                    LedgerError::Storage(format!(
                        "fold underflow: asset {} at sequence {}",
                        asset, record.sequence
                    ))
                })?;
            }
            LedgerEvent::AccountFrozen { .. } => self.frozen = true,
            LedgerEvent::AccountUnfrozen { .. } => self.frozen = false,
            LedgerEvent::AccountClosed => self.closed = true,
        }

        self.sequence = record.sequence;
        Ok(())
    }

    /// Balance for one asset (0 when the asset was never touched)
    pub fn balance(&self, asset: AssetId) -> u64 {
        self.balances.get(&asset).copied().unwrap_or(0)
    }

    /// True when every asset balance is exactly zero
    pub fn is_empty(&self) -> bool {
        self.balances.values().all(|v| *v == 0)
    }
}

/// Ledger service: the only writer to account streams.
///
/// Shares the projection with readers; applies each appended event to it
/// synchronously, so in-process reads always see the latest write.
pub struct Ledger {
    store: Arc<dyn EventStore>,
    projection: Arc<BalanceProjection>,
    max_append_retries: u32,
}

impl Ledger {
    pub fn new(store: Arc<dyn EventStore>, projection: Arc<BalanceProjection>) -> Self {
        Self::with_config(store, projection, &LedgerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn EventStore>,
        projection: Arc<BalanceProjection>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            store,
            projection,
            max_append_retries: config.max_append_retries,
        }
    }

    pub fn projection(&self) -> &Arc<BalanceProjection> {
        &self.projection
    }

    /// Open a new account. Fails only on storage error.
    pub async fn open_account(&self, owner: OwnerId) -> Result<AccountId, LedgerError> {
        let account = AccountId::new();
        let record = EventRecord::new(
            account,
            1,
            LedgerEvent::AccountOpened { owner },
            CorrelationId::new(),
            None,
        );

        self.store.append(account, 0, vec![record.clone()]).await?;
        self.projection.apply(&record)?;

        info!(account = %account, owner, "Account opened");
        Ok(account)
    }

    /// Credit funds. Permitted on frozen accounts (freeze blocks outbound
    /// movement only).
    pub async fn credit(
        &self,
        account: AccountId,
        asset: AssetId,
        amount: u64,
    ) -> Result<SeqNum, LedgerError> {
        self.credit_correlated(account, asset, amount, CorrelationId::new(), None)
            .await
    }

    pub async fn credit_correlated(
        &self,
        account: AccountId,
        asset: AssetId,
        amount: u64,
        correlation: CorrelationId,
        causation: Option<CorrelationId>,
    ) -> Result<SeqNum, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let record = self
            .mutate(account, correlation, causation, move |state| {
                if state.closed {
                    return Err(LedgerError::AccountClosed);
                }
                Ok(LedgerEvent::Credited { asset, amount })
            })
            .await?;

        debug!(account = %account, asset, amount, sequence = record.sequence, "Credited");
        Ok(record.sequence)
    }

    /// Debit funds. Rejected before append when the account is frozen or
    /// the projected balance is insufficient.
    pub async fn debit(
        &self,
        account: AccountId,
        asset: AssetId,
        amount: u64,
    ) -> Result<SeqNum, LedgerError> {
        self.debit_correlated(account, asset, amount, CorrelationId::new(), None)
            .await
    }

    pub async fn debit_correlated(
        &self,
        account: AccountId,
        asset: AssetId,
        amount: u64,
        correlation: CorrelationId,
        causation: Option<CorrelationId>,
    ) -> Result<SeqNum, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let record = self
            .mutate(account, correlation, causation, move |state| {
                if state.closed {
                    return Err(LedgerError::AccountClosed);
                }
                if state.frozen {
                    return Err(LedgerError::AccountFrozen);
                }
                let available = state.balance(asset);
                if available < amount {
                    return Err(LedgerError::InsufficientFunds {
                        available,
                        requested: amount,
                    });
                }
                Ok(LedgerEvent::Debited { asset, amount })
            })
            .await?;

        debug!(account = %account, asset, amount, sequence = record.sequence, "Debited");
        Ok(record.sequence)
    }

    /// Block outbound movement. Fails with `AlreadyFrozen` if no change.
    pub async fn freeze(
        &self,
        account: AccountId,
        reason: &str,
        authorized_by: &str,
    ) -> Result<SeqNum, LedgerError> {
        let reason = reason.to_string();
        let authorized_by = authorized_by.to_string();

        let record = self
            .mutate(account, CorrelationId::new(), None, move |state| {
                if state.closed {
                    return Err(LedgerError::AccountClosed);
                }
                if state.frozen {
                    return Err(LedgerError::AlreadyFrozen);
                }
                Ok(LedgerEvent::AccountFrozen {
                    reason: reason.clone(),
                    authorized_by: authorized_by.clone(),
                })
            })
            .await?;

        warn!(account = %account, sequence = record.sequence, "Account frozen");
        Ok(record.sequence)
    }

    /// Re-enable outbound movement. Fails with `NotFrozen` if no change.
    pub async fn unfreeze(
        &self,
        account: AccountId,
        reason: &str,
        authorized_by: &str,
    ) -> Result<SeqNum, LedgerError> {
        let reason = reason.to_string();
        let authorized_by = authorized_by.to_string();

        let record = self
            .mutate(account, CorrelationId::new(), None, move |state| {
                if state.closed {
                    return Err(LedgerError::AccountClosed);
                }
                if !state.frozen {
                    return Err(LedgerError::NotFrozen);
                }
                Ok(LedgerEvent::AccountUnfrozen {
                    reason: reason.clone(),
                    authorized_by: authorized_by.clone(),
                })
            })
            .await?;

        info!(account = %account, sequence = record.sequence, "Account unfrozen");
        Ok(record.sequence)
    }

    /// Close the account. Requires every balance to be exactly zero and
    /// the account not frozen. An account that ever held funds is never
    /// physically deleted; closing only seals the stream.
    pub async fn close_account(&self, account: AccountId) -> Result<SeqNum, LedgerError> {
        let record = self
            .mutate(account, CorrelationId::new(), None, |state| {
                if state.closed {
                    return Err(LedgerError::AccountClosed);
                }
                if state.frozen {
                    return Err(LedgerError::AccountFrozen);
                }
                if !state.is_empty() {
                    return Err(LedgerError::NonZeroBalance);
                }
                Ok(LedgerEvent::AccountClosed)
            })
            .await?;

        info!(account = %account, "Account closed");
        Ok(record.sequence)
    }

    /// Current aggregate state (snapshot + event tail)
    pub async fn account_state(&self, account: AccountId) -> Result<AccountState, LedgerError> {
        self.load_state(account).await
    }

    /// Projected balance, hydrating the projection on first touch after a
    /// process restart
    pub async fn balance_of(
        &self,
        account: AccountId,
        asset: AssetId,
    ) -> Result<u64, LedgerError> {
        if self.projection.last_applied(account) == 0 {
            let history = self.store.load(account).await?;
            if history.is_empty() {
                return Err(LedgerError::AccountNotFound(account.to_string()));
            }
            self.projection.rebuild(account, &history)?;
        }
        Ok(self.projection.balance_of(account, asset))
    }

    /// Audit/recovery path: replay the full history into the projection
    /// from scratch. The result must equal the incremental value.
    pub async fn rebuild_projection(&self, account: AccountId) -> Result<(), LedgerError> {
        let history = self.store.load(account).await?;
        if history.is_empty() {
            return Err(LedgerError::AccountNotFound(account.to_string()));
        }
        self.projection.rebuild(account, &history)
    }

    /// Take a snapshot of the account at its current head, making older
    /// events eligible for archival
    pub async fn take_snapshot(&self, account: AccountId) -> Result<BalanceSnapshot, LedgerError> {
        let state = self.load_state(account).await?;
        let snapshot = BalanceSnapshot {
            aggregate_id: state.id,
            sequence: state.sequence,
            owner: state.owner,
            frozen: state.frozen,
            closed: state.closed,
            opened_at_ms: state.opened_at_ms,
            balances: state.balances.iter().map(|(k, v)| (*k, *v)).collect::<BTreeMap<_, _>>(),
            taken_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.store.save_snapshot(snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Move replay-redundant events older than `cutoff_ms` to cold storage
    pub async fn archive_before(
        &self,
        account: AccountId,
        cutoff_ms: i64,
    ) -> Result<usize, LedgerError> {
        self.store.archive_before(account, cutoff_ms).await
    }

    async fn load_state(&self, account: AccountId) -> Result<AccountState, LedgerError> {
        match self.store.snapshot(account).await? {
            Some(snapshot) => {
                let mut state = AccountState::from_snapshot(&snapshot);
                let tail = self.store.load_from(account, state.sequence + 1).await?;
                for record in &tail {
                    state.apply(record)?;
                }
                Ok(state)
            }
            None => {
                let history = self.store.load(account).await?;
                if history.is_empty() {
                    return Err(LedgerError::AccountNotFound(account.to_string()));
                }
                AccountState::replay(&history)
            }
        }
    }

    /// Optimistic append-and-apply loop shared by all mutations.
    ///
    /// `validate` sees the freshly loaded state and returns the event to
    /// append, or the business error that rejects the operation.
    async fn mutate<F>(
        &self,
        account: AccountId,
        correlation: CorrelationId,
        causation: Option<CorrelationId>,
        validate: F,
    ) -> Result<EventRecord, LedgerError>
    where
        F: Fn(&AccountState) -> Result<LedgerEvent, LedgerError>,
    {
        let mut attempt = 0;
        loop {
            let state = self.load_state(account).await?;
            let event = validate(&state)?;
            let record = EventRecord::new(
                account,
                state.sequence + 1,
                event,
                correlation,
                causation,
            );

            match self
                .store
                .append(account, state.sequence, vec![record.clone()])
                .await
            {
                Ok(_) => {
                    // A gap means this process never hydrated the account;
                    // fold the full history instead of the single event.
                    if self.projection.last_applied(account) + 1 < record.sequence {
                        let history = self.store.load(account).await?;
                        self.projection.rebuild(account, &history)?;
                    } else {
                        self.projection.apply(&record)?;
                    }
                    return Ok(record);
                }
                Err(LedgerError::SequenceConflict { expected, found }) => {
                    attempt += 1;
                    if attempt >= self.max_append_retries {
                        warn!(
                            account = %account,
                            attempts = attempt,
                            "Append retries exhausted"
                        );
                        return Err(LedgerError::ConcurrencyConflict);
                    }
                    debug!(
                        account = %account,
                        expected,
                        found,
                        attempt,
                        "Sequence conflict, reloading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
