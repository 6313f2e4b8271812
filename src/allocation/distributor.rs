//! Bank Allocation Distributor
//!
//! Turns one logical amount into per-custodian movements according to the
//! account's allocation percentages, executing each leg through the
//! resilience layer. The split itself is [`preview_distribution`]: floor
//! proportional with the rounding remainder on the primary binding, so
//! the legs always sum exactly to the input amount.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::{AllocationError, AllocationStore, DistributionLine, preview_distribution};
use crate::core_types::{AccountId, AssetId};
use crate::custodian::{CallOutcome, CustodianOperation, CustodianRegistry, ResilienceError};

/// Which way money moves relative to the custodians
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// Funds arriving: deposit each share into its custodian
    Inbound,
    /// Funds leaving: withdraw each share from its custodian
    Outbound,
}

impl FlowDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDirection::Inbound => "INBOUND",
            FlowDirection::Outbound => "OUTBOUND",
        }
    }
}

/// One executed (or deferred) leg of a distribution
#[derive(Debug, Clone)]
pub struct DistributionLeg {
    pub code: String,
    pub amount: u64,
    pub outcome: CallOutcome,
}

/// Distributor error types
#[derive(Error, Debug, Clone)]
pub enum DistributorError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Custodian {code} failed: {source}")]
    Custodian {
        code: String,
        source: ResilienceError,
    },
}

/// Executes allocation splits against the custodian rails
pub struct BankDistributor {
    allocations: Arc<AllocationStore>,
    custodians: Arc<CustodianRegistry>,
}

impl BankDistributor {
    pub fn new(allocations: Arc<AllocationStore>, custodians: Arc<CustodianRegistry>) -> Self {
        Self {
            allocations,
            custodians,
        }
    }

    pub fn allocations(&self) -> &Arc<AllocationStore> {
        &self.allocations
    }

    /// Pure calculation for UI confirmation, no side effects
    pub fn preview(
        &self,
        account: AccountId,
        amount: u64,
    ) -> Result<Vec<DistributionLine>, DistributorError> {
        Ok(self.allocations.preview(account, amount)?)
    }

    /// Split `amount` across the account's custodians and move each share
    /// through the resilience layer. Legs with a zero share are skipped.
    ///
    /// A custodian outage does not fail the leg: the resilience layer
    /// defers the write and replays it when the breaker closes. Only hard
    /// rejections and full queues surface as errors.
    pub async fn distribute(
        &self,
        account: AccountId,
        asset: AssetId,
        amount: u64,
        direction: FlowDirection,
    ) -> Result<Vec<DistributionLeg>, DistributorError> {
        let set = self.allocations.get(account)?;
        let lines = preview_distribution(amount, &set)?;
        let account_ref = account.to_string();

        let mut legs = Vec::with_capacity(lines.len());
        for line in lines {
            if line.amount == 0 {
                continue;
            }

            let custodian =
                self.custodians
                    .get(&line.code)
                    .map_err(|source| DistributorError::Custodian {
                        code: line.code.clone(),
                        source,
                    })?;

            let op = match direction {
                FlowDirection::Inbound => CustodianOperation::Deposit {
                    account_ref: account_ref.clone(),
                    asset,
                    amount: line.amount,
                },
                FlowDirection::Outbound => CustodianOperation::Withdraw {
                    account_ref: account_ref.clone(),
                    asset,
                    amount: line.amount,
                },
            };

            let outcome =
                custodian
                    .execute(op)
                    .await
                    .map_err(|source| DistributorError::Custodian {
                        code: line.code.clone(),
                        source,
                    })?;

            if outcome.is_deferred() {
                warn!(
                    account = %account,
                    custodian = %line.code,
                    amount = line.amount,
                    "Distribution leg deferred"
                );
            }

            legs.push(DistributionLeg {
                code: line.code,
                amount: line.amount,
                outcome,
            });
        }

        info!(
            account = %account,
            asset,
            amount,
            direction = direction.as_str(),
            legs = legs.len(),
            "Distribution executed"
        );
        Ok(legs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::CustodianBinding;
    use crate::config::{AllocationConfig, ResilienceConfig};
    use crate::custodian::connector::mock::MockConnector;

    fn setup() -> (BankDistributor, Arc<CustodianRegistry>, AccountId) {
        let registry = Arc::new(CustodianRegistry::new());
        for code in ["a", "b", "c"] {
            registry.register(
                Arc::new(MockConnector::new(code)),
                &ResilienceConfig::default(),
            );
        }

        let allocations = Arc::new(AllocationStore::new(AllocationConfig::default()));
        let account = AccountId::new();
        allocations
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("a", 40),
                    CustodianBinding::new("b", 30),
                    CustodianBinding::new("c", 30),
                ],
            )
            .unwrap();

        (
            BankDistributor::new(allocations, registry.clone()),
            registry,
            account,
        )
    }

    #[tokio::test]
    async fn test_distribute_moves_every_share() {
        let (distributor, _, account) = setup();

        let legs = distributor
            .distribute(account, 1, 1000, FlowDirection::Inbound)
            .await
            .unwrap();

        assert_eq!(legs.len(), 3);
        assert_eq!(legs.iter().map(|l| l.amount).sum::<u64>(), 1000);
        assert!(legs.iter().all(|l| matches!(l.outcome, CallOutcome::Executed(_))));
    }

    #[tokio::test]
    async fn test_distribute_defers_on_open_circuit() {
        let (distributor, registry, account) = setup();

        // Take custodian "b" down
        let b = registry.get("b").unwrap();
        for _ in 0..5 {
            b.breaker().record_failure();
        }

        let legs = distributor
            .distribute(account, 1, 1000, FlowDirection::Outbound)
            .await
            .unwrap();

        let leg_b = legs.iter().find(|l| l.code == "b").unwrap();
        assert!(leg_b.outcome.is_deferred());
        assert_eq!(b.deferred_len(), 1);

        // The other legs executed normally
        assert!(legs
            .iter()
            .filter(|l| l.code != "b")
            .all(|l| matches!(l.outcome, CallOutcome::Executed(_))));
    }

    #[tokio::test]
    async fn test_unknown_custodian_surfaces() {
        let registry = Arc::new(CustodianRegistry::new());
        let allocations = Arc::new(AllocationStore::new(AllocationConfig::default()));
        let account = AccountId::new();
        allocations
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("ghost", 50),
                    CustodianBinding::new("phantom", 50),
                ],
            )
            .unwrap();

        let distributor = BankDistributor::new(allocations, registry);
        let err = distributor
            .distribute(account, 1, 100, FlowDirection::Inbound)
            .await
            .unwrap_err();

        assert!(matches!(err, DistributorError::Custodian { .. }));
    }
}
