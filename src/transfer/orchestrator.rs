//! Transfer Orchestrator
//!
//! Coordinates a debit on the source and a credit on the destination as
//! one logical unit, without a transaction spanning the two aggregates
//! (event-sourced aggregates are independently append-ordered).
//!
//! This is a saga with a single compensating action, not a two-phase
//! commit: internal accounts live in the same storage domain, and a
//! failure of the credit leg is a rare infrastructure error rather than a
//! business rejection. No cross-aggregate lock is held across the two
//! appends; correctness comes from the compensation path.
//!
//! Once the debit is durably appended the saga runs to completion or
//! compensation autonomously; a caller can only cancel before that point.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info, warn};

use super::error::TransferError;
use super::state::TransferStatus;
use super::types::{CompensationOutcome, TransferId, TransferRecord, TransferRequest};
use crate::ledger::{Ledger, LedgerError};

/// Bounded attempts for the reversing credit before escalating
const COMPENSATION_RETRIES: u32 = 3;

/// Transfer Orchestrator - drives the debit/credit saga
pub struct TransferOrchestrator {
    ledger: Arc<Ledger>,
    transfers: DashMap<TransferId, TransferRecord>,
    by_reference: DashMap<String, TransferId>,
}

impl TransferOrchestrator {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            transfers: DashMap::new(),
            by_reference: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Run one transfer to a terminal status.
    ///
    /// Returns the settled record, or the originating error; in both cases
    /// the stored record carries the outcome for audit. A duplicate client
    /// reference returns the original record instead of moving money twice.
    pub async fn initiate(&self, req: TransferRequest) -> Result<TransferRecord, TransferError> {
        if req.amount == 0 {
            return Err(TransferError::InvalidAmount);
        }
        if req.source == req.destination {
            return Err(TransferError::SameAccount);
        }

        if let Some(ref reference) = req.reference
            && let Some(existing_id) = self.by_reference.get(reference)
        {
            let existing = self
                .transfers
                .get(&*existing_id)
                .map(|r| r.clone())
                .ok_or_else(|| TransferError::TransferNotFound(existing_id.to_string()))?;
            info!(
                reference = %reference,
                transfer_id = %existing.id,
                "Duplicate reference, returning existing transfer"
            );
            return Ok(existing);
        }

        // Pre-checks; the authoritative checks happen again at debit time
        // under the source's compare-and-append.
        let source_state = self.ledger.account_state(req.source).await.map_err(|e| {
            match e {
                LedgerError::AccountNotFound(_) => TransferError::SourceAccountNotFound,
                other => TransferError::Ledger(other),
            }
        })?;
        if source_state.frozen {
            return Err(TransferError::Ledger(LedgerError::AccountFrozen));
        }
        let available = source_state.balance(req.asset);
        if available < req.amount {
            return Err(TransferError::Ledger(LedgerError::InsufficientFunds {
                available,
                requested: req.amount,
            }));
        }
        let destination_state =
            self.ledger.account_state(req.destination).await.map_err(|e| match e {
                LedgerError::AccountNotFound(_) => TransferError::DestinationAccountNotFound,
                other => TransferError::Ledger(other),
            })?;
        if destination_state.closed {
            return Err(TransferError::Ledger(LedgerError::AccountClosed));
        }

        let record = TransferRecord::new(TransferId::new(), &req);
        if let Some(ref reference) = req.reference {
            self.by_reference.insert(reference.clone(), record.id);
        }
        self.transfers.insert(record.id, record.clone());
        info!(
            transfer_id = %record.id,
            source = %req.source,
            destination = %req.destination,
            asset = req.asset,
            amount = req.amount,
            "Transfer created"
        );

        self.run(record).await
    }

    /// Get a transfer record
    pub fn get(&self, id: TransferId) -> Option<TransferRecord> {
        self.transfers.get(&id).map(|r| r.clone())
    }

    /// Step 1 + 2 of the saga with the compensation path
    async fn run(&self, record: TransferRecord) -> Result<TransferRecord, TransferError> {
        // Step 1: debit the source. Fail-fast on rejection - no credit is
        // ever attempted, no partial effect exists.
        if let Err(e) = self
            .ledger
            .debit_correlated(
                record.source,
                record.asset,
                record.amount,
                record.correlation_id,
                None,
            )
            .await
        {
            warn!(transfer_id = %record.id, error = %e, "Debit leg rejected");
            self.finish(record.id, TransferStatus::Failed, Some(e.code()), None);
            return Err(TransferError::Ledger(e));
        }

        // Step 2: credit the destination.
        match self
            .ledger
            .credit_correlated(
                record.destination,
                record.asset,
                record.amount,
                record.correlation_id,
                None,
            )
            .await
        {
            Ok(_) => {
                let settled = self.finish(record.id, TransferStatus::Settled, None, None);
                info!(transfer_id = %record.id, "Transfer settled");
                settled.ok_or_else(|| TransferError::TransferNotFound(record.id.to_string()))
            }
            Err(credit_err) => {
                warn!(
                    transfer_id = %record.id,
                    error = %credit_err,
                    "Credit leg failed, compensating source"
                );
                self.compensate(&record, credit_err).await
            }
        }
    }

    /// Reversing credit back onto the source. The system must never leave
    /// a transfer in a state where money vanished: either both legs
    /// succeed or the debit is compensated.
    async fn compensate(
        &self,
        record: &TransferRecord,
        credit_err: LedgerError,
    ) -> Result<TransferRecord, TransferError> {
        let mut last_err = None;
        for attempt in 1..=COMPENSATION_RETRIES {
            match self
                .ledger
                .credit_correlated(
                    record.source,
                    record.asset,
                    record.amount,
                    record.correlation_id,
                    Some(record.correlation_id),
                )
                .await
            {
                Ok(_) => {
                    self.finish(
                        record.id,
                        TransferStatus::Failed,
                        Some(credit_err.code()),
                        Some(CompensationOutcome::Compensated),
                    );
                    info!(transfer_id = %record.id, "Debit compensated, transfer failed cleanly");
                    return Err(TransferError::Ledger(credit_err));
                }
                Err(e) => {
                    warn!(
                        transfer_id = %record.id,
                        attempt,
                        error = %e,
                        "Compensation attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        // Fatal: debited but not restored. Escalate, never drop.
        let detail = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        error!(
            transfer_id = %record.id,
            source = %record.source,
            amount = record.amount,
            detail = %detail,
            "COMPENSATION FAILURE: manual operator intervention required"
        );
        self.finish(
            record.id,
            TransferStatus::Failed,
            Some(credit_err.code()),
            Some(CompensationOutcome::Escalated(detail.clone())),
        );
        Err(TransferError::CompensationFailure {
            transfer_id: record.id.to_string(),
            detail,
        })
    }

    /// Move the stored record to a terminal status (terminal records are
    /// immutable afterwards)
    fn finish(
        &self,
        id: TransferId,
        status: TransferStatus,
        error: Option<&str>,
        compensation: Option<CompensationOutcome>,
    ) -> Option<TransferRecord> {
        let mut entry = self.transfers.get_mut(&id)?;
        if entry.status.is_terminal() {
            return Some(entry.clone());
        }
        entry.status = status;
        entry.error = error.map(|e| e.to_string());
        entry.compensation = compensation;
        entry.updated_at = chrono::Utc::now().timestamp_millis();
        Some(entry.clone())
    }
}
