//! Settlement Engine
//!
//! Periodically nets inter-custodian obligations and issues one
//! settlement instruction per custodian pair instead of one per
//! underlying transfer.
//!
//! Obligations are internal accounting entries: every (debtor, creditor,
//! asset) direction has a system-owned ledger account whose balance is
//! the accumulated gross obligation. Recording an obligation credits that
//! account; settling debits it back to zero. Carrying a below-minimum
//! position forward is simply not debiting it, so nothing is ever lost
//! between periods and every movement stays replayable from the event log.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::batch::{BatchEntry, BatchId, BatchStatus, CustodianPair, SettlementBatch};
use crate::config::SettlementConfig;
use crate::core_types::{AccountId, AssetId, OwnerId};
use crate::custodian::{CustodianOperation, CustodianRegistry, ResilienceError};
use crate::ledger::{Ledger, LedgerError};

/// Owner id of the engine's internal obligation accounts
const SYSTEM_OWNER: OwnerId = 0;

/// Settlement error types
#[derive(Error, Debug, Clone)]
pub enum SettlementError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Custodian {code} failed: {source}")]
    Custodian {
        code: String,
        source: ResilienceError,
    },

    #[error("Unknown settlement mode: {0}")]
    UnknownMode(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),
}

/// How obligations are turned into instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementMode {
    /// Settle each obligation as it is recorded
    Realtime,
    /// Settle each direction gross at the period boundary
    Batch,
    /// Net opposing directions, one instruction per pair per period
    Net,
}

impl SettlementMode {
    pub fn from_config(mode: &str) -> Result<Self, SettlementError> {
        match mode {
            "realtime" => Ok(SettlementMode::Realtime),
            "batch" => Ok(SettlementMode::Batch),
            "net" => Ok(SettlementMode::Net),
            other => Err(SettlementError::UnknownMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementMode::Realtime => "realtime",
            SettlementMode::Batch => "batch",
            SettlementMode::Net => "net",
        }
    }
}

/// Inter-custodian settlement engine
pub struct SettlementEngine {
    ledger: Arc<Ledger>,
    custodians: Arc<CustodianRegistry>,
    mode: SettlementMode,
    period: Duration,
    min_settlement: u64,
    /// (debtor, creditor, asset) -> internal obligation account
    obligation_accounts: DashMap<(String, String, AssetId), AccountId>,
    /// Issued instruction keys; a key can only ever be issued once
    issued: DashSet<String>,
    batches: DashMap<BatchId, SettlementBatch>,
    period_start_ms: std::sync::Mutex<i64>,
    /// One close at a time
    closing: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("mode", &self.mode)
            .field("period", &self.period)
            .field("min_settlement", &self.min_settlement)
            .finish_non_exhaustive()
    }
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        custodians: Arc<CustodianRegistry>,
        config: &SettlementConfig,
    ) -> Result<Self, SettlementError> {
        Ok(Self {
            ledger,
            custodians,
            mode: SettlementMode::from_config(&config.mode)?,
            period: Duration::from_secs(config.period_secs),
            min_settlement: config.min_settlement_amount,
            obligation_accounts: DashMap::new(),
            issued: DashSet::new(),
            batches: DashMap::new(),
            period_start_ms: std::sync::Mutex::new(chrono::Utc::now().timestamp_millis()),
            closing: tokio::sync::Mutex::new(()),
        })
    }

    pub fn mode(&self) -> SettlementMode {
        self.mode
    }

    /// Record that `debtor` owes `creditor` `amount` of `asset`.
    ///
    /// Called as transfers touch custodian rails. In realtime mode the
    /// position settles immediately; otherwise it waits for the period
    /// boundary.
    pub async fn record_obligation(
        &self,
        debtor: &str,
        creditor: &str,
        asset: AssetId,
        amount: u64,
    ) -> Result<(), SettlementError> {
        let account = self.obligation_account(debtor, creditor, asset).await?;
        self.ledger.credit(account, asset, amount).await?;
        debug!(debtor, creditor, asset, amount, "Obligation recorded");

        if self.mode == SettlementMode::Realtime {
            self.close_period().await?;
        }
        Ok(())
    }

    /// Accumulated gross obligation for one direction
    pub async fn obligation(
        &self,
        debtor: &str,
        creditor: &str,
        asset: AssetId,
    ) -> Result<u64, SettlementError> {
        match self
            .obligation_accounts
            .get(&(debtor.to_string(), creditor.to_string(), asset))
        {
            Some(account) => Ok(self.ledger.balance_of(*account, asset).await?),
            None => Ok(0),
        }
    }

    /// Close the current period: net every pair, carry below-minimum
    /// positions forward, and issue exactly one instruction per remaining
    /// pair (per direction in gross/batch mode).
    pub async fn close_period(&self) -> Result<SettlementBatch, SettlementError> {
        let _guard = self.closing.lock().await;

        let period_end_ms = chrono::Utc::now().timestamp_millis();
        let period_start_ms = {
            let mut start = self.period_start_ms.lock().unwrap();
            std::mem::replace(&mut *start, period_end_ms)
        };

        let mut batch = SettlementBatch {
            id: BatchId::new(),
            period_start_ms,
            period_end_ms,
            entries: Vec::new(),
            status: BatchStatus::Open,
        };
        batch.status = BatchStatus::Closing;

        // All (pair, asset) combinations ever seen, normalized
        let combos: BTreeSet<(CustodianPair, AssetId)> = self
            .obligation_accounts
            .iter()
            .map(|e| {
                let (debtor, creditor, asset) = e.key();
                (CustodianPair::new(debtor, creditor), *asset)
            })
            .collect();

        for (pair, asset) in combos {
            match self.mode {
                SettlementMode::Batch => {
                    self.close_gross(&mut batch, &pair, asset).await?;
                }
                SettlementMode::Net | SettlementMode::Realtime => {
                    self.close_net(&mut batch, &pair, asset).await?;
                }
            }
        }

        batch.status = BatchStatus::Settled;
        self.batches.insert(batch.id, batch.clone());
        info!(
            batch_id = %batch.id,
            mode = self.mode.as_str(),
            entries = batch.entries.len(),
            "Settlement batch closed"
        );
        Ok(batch)
    }

    /// Re-issue the instructions of a closed batch. Keys that were already
    /// issued are skipped, so re-running settlement after a crash cannot
    /// double-settle. Returns the number of instructions actually sent.
    pub async fn reissue(&self, batch_id: BatchId) -> Result<usize, SettlementError> {
        let batch = self
            .batches
            .get(&batch_id)
            .map(|b| b.clone())
            .ok_or_else(|| SettlementError::BatchNotFound(batch_id.to_string()))?;

        let mut sent = 0;
        for entry in &batch.entries {
            let Some(ref key) = entry.instruction_key else {
                continue;
            };
            if self.issued.contains(key) {
                debug!(key = %key, "Instruction already issued, no-op");
                continue;
            }
            let (payer, payee) = if entry.net >= 0 {
                (entry.pair.a.clone(), entry.pair.b.clone())
            } else {
                (entry.pair.b.clone(), entry.pair.a.clone())
            };
            self.issue_instruction(
                &batch.id,
                &entry.pair,
                entry.asset,
                &payer,
                &payee,
                entry.net.unsigned_abs(),
            )
            .await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Batch lookup for the monitoring surface
    pub fn batch(&self, id: BatchId) -> Option<SettlementBatch> {
        self.batches.get(&id).map(|b| b.clone())
    }

    /// Drive the period loop. Also replays any deferred custodian writes
    /// each tick.
    pub async fn run(self: Arc<Self>) -> ! {
        info!(
            mode = self.mode.as_str(),
            period_secs = self.period.as_secs(),
            min_settlement = self.min_settlement,
            "Starting settlement engine"
        );

        loop {
            tokio::time::sleep(self.period).await;

            if let Err(e) = self.close_period().await {
                error!(error = %e, "Settlement period close failed");
            }
            self.custodians.replay_all_deferred().await;
        }
    }

    /// Net mode: offset the two directions, settle the remainder
    async fn close_net(
        &self,
        batch: &mut SettlementBatch,
        pair: &CustodianPair,
        asset: AssetId,
    ) -> Result<(), SettlementError> {
        let gross_ab = self.obligation(&pair.a, &pair.b, asset).await?;
        let gross_ba = self.obligation(&pair.b, &pair.a, asset).await?;
        if gross_ab == 0 && gross_ba == 0 {
            return Ok(());
        }

        let net = gross_ab as i64 - gross_ba as i64;
        if net == 0 {
            // Perfectly offsetting: clear both legs, nothing moves
            self.clear_direction(&pair.a, &pair.b, asset, gross_ab).await?;
            self.clear_direction(&pair.b, &pair.a, asset, gross_ba).await?;
            batch.entries.push(BatchEntry {
                pair: pair.clone(),
                asset,
                net: 0,
                carried: false,
                instruction_key: None,
                error: None,
            });
            return Ok(());
        }

        let (payer, payee) = if net > 0 {
            (pair.a.clone(), pair.b.clone())
        } else {
            (pair.b.clone(), pair.a.clone())
        };
        let amount = net.unsigned_abs();

        if amount < self.min_settlement {
            debug!(pair = %pair, asset, amount, "Below minimum, carried forward");
            batch.entries.push(BatchEntry {
                pair: pair.clone(),
                asset,
                net,
                carried: true,
                instruction_key: None,
                error: None,
            });
            return Ok(());
        }

        // Net down both legs, then instruct the payer
        self.clear_direction(&pair.a, &pair.b, asset, gross_ab).await?;
        self.clear_direction(&pair.b, &pair.a, asset, gross_ba).await?;

        match self
            .issue_instruction(&batch.id, pair, asset, &payer, &payee, amount)
            .await
        {
            Ok(key) => {
                batch.entries.push(BatchEntry {
                    pair: pair.clone(),
                    asset,
                    net,
                    carried: false,
                    instruction_key: Some(key),
                    error: None,
                });
            }
            Err(e) => {
                // Restore the obligations for the next period
                self.restore_direction(&pair.a, &pair.b, asset, gross_ab).await?;
                self.restore_direction(&pair.b, &pair.a, asset, gross_ba).await?;
                warn!(pair = %pair, asset, error = %e, "Settlement instruction failed, carried");
                batch.entries.push(BatchEntry {
                    pair: pair.clone(),
                    asset,
                    net,
                    carried: true,
                    instruction_key: None,
                    error: Some(e.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Batch mode: each direction settles gross, independently
    async fn close_gross(
        &self,
        batch: &mut SettlementBatch,
        pair: &CustodianPair,
        asset: AssetId,
    ) -> Result<(), SettlementError> {
        for (payer, payee) in [
            (pair.a.clone(), pair.b.clone()),
            (pair.b.clone(), pair.a.clone()),
        ] {
            let gross = self.obligation(&payer, &payee, asset).await?;
            if gross == 0 {
                continue;
            }
            let signed = if payer == pair.a {
                gross as i64
            } else {
                -(gross as i64)
            };

            if gross < self.min_settlement {
                batch.entries.push(BatchEntry {
                    pair: pair.clone(),
                    asset,
                    net: signed,
                    carried: true,
                    instruction_key: None,
                    error: None,
                });
                continue;
            }

            self.clear_direction(&payer, &payee, asset, gross).await?;
            match self
                .issue_instruction(&batch.id, pair, asset, &payer, &payee, gross)
                .await
            {
                Ok(key) => {
                    batch.entries.push(BatchEntry {
                        pair: pair.clone(),
                        asset,
                        net: signed,
                        carried: false,
                        instruction_key: Some(key),
                        error: None,
                    });
                }
                Err(e) => {
                    self.restore_direction(&payer, &payee, asset, gross).await?;
                    warn!(pair = %pair, asset, error = %e, "Gross settlement failed, carried");
                    batch.entries.push(BatchEntry {
                        pair: pair.clone(),
                        asset,
                        net: signed,
                        carried: true,
                        instruction_key: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(())
    }

    async fn obligation_account(
        &self,
        debtor: &str,
        creditor: &str,
        asset: AssetId,
    ) -> Result<AccountId, SettlementError> {
        let key = (debtor.to_string(), creditor.to_string(), asset);
        if let Some(account) = self.obligation_accounts.get(&key) {
            return Ok(*account);
        }

        let account = self.ledger.open_account(SYSTEM_OWNER).await?;
        // A raced open leaves one unused empty account behind; harmless
        let entry = self.obligation_accounts.entry(key).or_insert(account);
        Ok(*entry)
    }

    async fn clear_direction(
        &self,
        debtor: &str,
        creditor: &str,
        asset: AssetId,
        amount: u64,
    ) -> Result<(), SettlementError> {
        if amount == 0 {
            return Ok(());
        }
        let account = self.obligation_account(debtor, creditor, asset).await?;
        self.ledger.debit(account, asset, amount).await?;
        Ok(())
    }

    async fn restore_direction(
        &self,
        debtor: &str,
        creditor: &str,
        asset: AssetId,
        amount: u64,
    ) -> Result<(), SettlementError> {
        if amount == 0 {
            return Ok(());
        }
        let account = self.obligation_account(debtor, creditor, asset).await?;
        self.ledger.credit(account, asset, amount).await?;
        Ok(())
    }

    /// Issue one settlement instruction, idempotent by its key: the payer
    /// custodian receives the key as the operation reference and a repeat
    /// issue is a local no-op.
    async fn issue_instruction(
        &self,
        batch_id: &BatchId,
        pair: &CustodianPair,
        asset: AssetId,
        payer: &str,
        payee: &str,
        amount: u64,
    ) -> Result<String, SettlementError> {
        let key = format!("{}:{}:{}:{}", batch_id, pair.key(), asset, payer);
        if !self.issued.insert(key.clone()) {
            return Ok(key);
        }

        let custodian = self
            .custodians
            .get(payer)
            .map_err(|source| SettlementError::Custodian {
                code: payer.to_string(),
                source,
            })?;

        let op = CustodianOperation::Settle {
            reference: key.clone(),
            counterparty: payee.to_string(),
            asset,
            amount,
        };

        match custodian.execute(op).await {
            Ok(outcome) => {
                info!(
                    key = %key,
                    payer,
                    payee,
                    asset,
                    amount,
                    deferred = outcome.is_deferred(),
                    "Settlement instruction issued"
                );
                Ok(key)
            }
            Err(source) => {
                // Allow a later retry to issue this key again
                self.issued.remove(&key);
                Err(SettlementError::Custodian {
                    code: payer.to_string(),
                    source,
                })
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::custodian::connector::mock::MockConnector;
    use crate::ledger::{BalanceProjection, MemoryEventStore};

    fn ledger() -> Arc<Ledger> {
        Arc::new(Ledger::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(BalanceProjection::new()),
        ))
    }

    fn registry() -> (Arc<CustodianRegistry>, Arc<MockConnector>, Arc<MockConnector>) {
        let registry = Arc::new(CustodianRegistry::new());
        let alpha = Arc::new(MockConnector::new("alpha"));
        let beta = Arc::new(MockConnector::new("beta"));
        registry.register(alpha.clone(), &ResilienceConfig::default());
        registry.register(beta.clone(), &ResilienceConfig::default());
        (registry, alpha, beta)
    }

    fn config(mode: &str, min: u64) -> SettlementConfig {
        SettlementConfig {
            mode: mode.to_string(),
            period_secs: 3600,
            min_settlement_amount: min,
        }
    }

    #[tokio::test]
    async fn test_net_settlement_one_instruction_per_pair() {
        let (registry, alpha, beta) = registry();
        let engine = SettlementEngine::new(ledger(), registry, &config("net", 1)).unwrap();

        engine.record_obligation("alpha", "beta", 1, 1000).await.unwrap();
        engine.record_obligation("beta", "alpha", 1, 400).await.unwrap();

        let batch = engine.close_period().await.unwrap();
        assert_eq!(batch.status, BatchStatus::Settled);
        assert_eq!(batch.entries.len(), 1);

        let entry = &batch.entries[0];
        assert_eq!(entry.net, 600);
        assert!(!entry.carried);
        assert!(entry.instruction_key.is_some());

        // Exactly one instruction, from the net payer
        assert_eq!(alpha.call_count(), 1);
        assert_eq!(beta.call_count(), 0);

        // Obligations are cleared down to zero
        assert_eq!(engine.obligation("alpha", "beta", 1).await.unwrap(), 0);
        assert_eq!(engine.obligation("beta", "alpha", 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offsetting_obligations_clear_without_instruction() {
        let (registry, alpha, beta) = registry();
        let engine = SettlementEngine::new(ledger(), registry, &config("net", 1)).unwrap();

        engine.record_obligation("alpha", "beta", 1, 300).await.unwrap();
        engine.record_obligation("beta", "alpha", 1, 300).await.unwrap();

        let batch = engine.close_period().await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].net, 0);
        assert!(batch.entries[0].instruction_key.is_none());

        assert_eq!(alpha.call_count(), 0);
        assert_eq!(beta.call_count(), 0);
        assert_eq!(engine.obligation("alpha", "beta", 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_below_minimum_carried_forward() {
        let (registry, alpha, _) = registry();
        let engine = SettlementEngine::new(ledger(), registry, &config("net", 500)).unwrap();

        engine.record_obligation("alpha", "beta", 1, 100).await.unwrap();

        let batch = engine.close_period().await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert!(batch.entries[0].carried);
        assert_eq!(alpha.call_count(), 0);
        // Position survives into the next period
        assert_eq!(engine.obligation("alpha", "beta", 1).await.unwrap(), 100);

        // More obligations push it over the minimum
        engine.record_obligation("alpha", "beta", 1, 450).await.unwrap();
        let batch = engine.close_period().await.unwrap();
        assert_eq!(batch.entries[0].net, 550);
        assert!(!batch.entries[0].carried);
        assert_eq!(alpha.call_count(), 1);
        assert_eq!(engine.obligation("alpha", "beta", 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reissue_is_idempotent() {
        let (registry, alpha, _) = registry();
        let engine = SettlementEngine::new(ledger(), registry, &config("net", 1)).unwrap();

        engine.record_obligation("alpha", "beta", 1, 800).await.unwrap();
        let batch = engine.close_period().await.unwrap();
        assert_eq!(alpha.call_count(), 1);

        // Re-running the settled batch is a no-op, not a double transfer
        let sent = engine.reissue(batch.id).await.unwrap();
        assert_eq!(sent, 0);
        assert_eq!(alpha.call_count(), 1);
    }

    #[tokio::test]
    async fn test_realtime_mode_settles_immediately() {
        let (registry, alpha, _) = registry();
        let engine = SettlementEngine::new(ledger(), registry, &config("realtime", 1)).unwrap();

        engine.record_obligation("alpha", "beta", 1, 250).await.unwrap();

        assert_eq!(alpha.call_count(), 1);
        assert_eq!(engine.obligation("alpha", "beta", 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gross_mode_settles_both_directions() {
        let (registry, alpha, beta) = registry();
        let engine = SettlementEngine::new(ledger(), registry, &config("batch", 1)).unwrap();

        engine.record_obligation("alpha", "beta", 1, 1000).await.unwrap();
        engine.record_obligation("beta", "alpha", 1, 400).await.unwrap();

        let batch = engine.close_period().await.unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(alpha.call_count(), 1);
        assert_eq!(beta.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_mode_rejected() {
        let (registry, _, _) = registry();
        let err = SettlementEngine::new(ledger(), registry, &config("hourly", 1)).unwrap_err();
        assert!(matches!(err, SettlementError::UnknownMode(_)));
    }

    #[tokio::test]
    async fn test_failed_instruction_restores_obligations() {
        let (registry, alpha, _) = registry();
        // Hard rejection: not retried, not deferred
        alpha.push_outcome(Err(crate::custodian::ConnectorError::Rejected(
            "limits".to_string(),
        )));

        let engine = SettlementEngine::new(ledger(), registry, &config("net", 1)).unwrap();
        engine.record_obligation("alpha", "beta", 1, 900).await.unwrap();

        let batch = engine.close_period().await.unwrap();
        assert!(batch.entries[0].carried);
        assert!(batch.entries[0].error.is_some());

        // Position restored for the next period
        assert_eq!(engine.obligation("alpha", "beta", 1).await.unwrap(), 900);

        // Next close succeeds (mock reverts to default success)
        let batch = engine.close_period().await.unwrap();
        assert!(!batch.entries[0].carried);
        assert_eq!(engine.obligation("alpha", "beta", 1).await.unwrap(), 0);
    }
}
