//! Bank Allocation
//!
//! Per-account custodian bindings: which external banks hold a user's
//! funds, at which percentage split. The active percentages of an account
//! always sum to exactly 100 (enforced on every full reconfiguration and
//! at distribution time), with exactly one binding marked primary.

pub mod distributor;

pub use distributor::{BankDistributor, DistributionLeg, DistributorError, FlowDirection};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AllocationConfig;
use crate::core_types::AccountId;

/// One account -> custodian mapping with its allocation percentage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianBinding {
    pub code: String,
    pub percentage: u32,
    pub primary: bool,
}

impl CustodianBinding {
    pub fn new(code: &str, percentage: u32) -> Self {
        Self {
            code: code.to_string(),
            percentage,
            primary: false,
        }
    }

    pub fn primary(code: &str, percentage: u32) -> Self {
        Self {
            code: code.to_string(),
            percentage,
            primary: true,
        }
    }
}

/// Allocation error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Allocation percentages must sum to exactly 100, got {total}")]
    InvalidPercentageTotal { total: u32 },

    #[error("Binding count {count} outside allowed range {min}-{max}")]
    BindingCountOutOfBounds {
        count: usize,
        min: usize,
        max: usize,
    },

    #[error("Exactly one binding must be primary, got {count}")]
    PrimaryCountInvalid { count: usize },

    #[error("Duplicate custodian binding: {0}")]
    DuplicateCustodian(String),

    #[error("No binding for custodian: {0}")]
    UnknownBinding(String),

    #[error("Adding {percentage}% would push the total to {total} (over 100)")]
    WouldExceedTotal { percentage: u32, total: u32 },

    #[error("Removing the binding would leave the total at {total} (below 100)")]
    WouldDropBelowTotal { total: u32 },

    #[error("Cannot remove the primary binding: {0}")]
    CannotRemovePrimary(String),

    #[error("Account has no custodian allocations: {0}")]
    NoAllocations(String),

    #[error("Allocations sum to {total}, reconfiguration incomplete")]
    IncompleteAllocation { total: u32 },

    #[error("Amount must be greater than zero")]
    InvalidAmount,
}

impl AllocationError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            AllocationError::InvalidPercentageTotal { .. } => "INVALID_PERCENTAGE_TOTAL",
            AllocationError::BindingCountOutOfBounds { .. } => "BINDING_COUNT_OUT_OF_BOUNDS",
            AllocationError::PrimaryCountInvalid { .. } => "PRIMARY_COUNT_INVALID",
            AllocationError::DuplicateCustodian(_) => "DUPLICATE_CUSTODIAN",
            AllocationError::UnknownBinding(_) => "UNKNOWN_BINDING",
            AllocationError::WouldExceedTotal { .. } => "WOULD_EXCEED_TOTAL",
            AllocationError::WouldDropBelowTotal { .. } => "WOULD_DROP_BELOW_TOTAL",
            AllocationError::CannotRemovePrimary(_) => "CANNOT_REMOVE_PRIMARY",
            AllocationError::NoAllocations(_) => "NO_ALLOCATIONS",
            AllocationError::IncompleteAllocation { .. } => "INCOMPLETE_ALLOCATION",
            AllocationError::InvalidAmount => "INVALID_AMOUNT",
        }
    }
}

/// A validated (or mid-reconfiguration) set of bindings for one account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationSet {
    bindings: Vec<CustodianBinding>,
}

impl AllocationSet {
    pub fn bindings(&self) -> &[CustodianBinding] {
        &self.bindings
    }

    pub fn total(&self) -> u32 {
        self.bindings.iter().map(|b| b.percentage).sum()
    }

    pub fn primary_binding(&self) -> Option<&CustodianBinding> {
        self.bindings.iter().find(|b| b.primary)
    }

    fn find(&self, code: &str) -> Option<usize> {
        self.bindings.iter().position(|b| b.code == code)
    }

    /// Complete-set validation: sum exactly 100, count within bounds,
    /// exactly one primary, no duplicate codes
    fn validate_complete(&self, config: &AllocationConfig) -> Result<(), AllocationError> {
        let count = self.bindings.len();
        if count < config.min_bindings || count > config.max_bindings {
            return Err(AllocationError::BindingCountOutOfBounds {
                count,
                min: config.min_bindings,
                max: config.max_bindings,
            });
        }

        for (i, binding) in self.bindings.iter().enumerate() {
            if self.bindings[..i].iter().any(|b| b.code == binding.code) {
                return Err(AllocationError::DuplicateCustodian(binding.code.clone()));
            }
        }

        let primaries = self.bindings.iter().filter(|b| b.primary).count();
        if primaries != 1 {
            return Err(AllocationError::PrimaryCountInvalid { count: primaries });
        }

        let total = self.total();
        if total != 100 {
            return Err(AllocationError::InvalidPercentageTotal { total });
        }

        Ok(())
    }
}

/// Per-custodian share of a distributed amount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionLine {
    pub code: String,
    pub amount: u64,
    pub primary: bool,
}

/// Pure split calculation: proportional floor division, with the rounding
/// remainder assigned to the primary binding so the lines always sum
/// exactly to the input amount. No side effects; used for UI confirmation
/// before committing funds movement.
pub fn preview_distribution(
    amount: u64,
    set: &AllocationSet,
) -> Result<Vec<DistributionLine>, AllocationError> {
    if amount == 0 {
        return Err(AllocationError::InvalidAmount);
    }
    let total = set.total();
    if total != 100 {
        return Err(AllocationError::IncompleteAllocation { total });
    }

    let mut lines: Vec<DistributionLine> = set
        .bindings()
        .iter()
        .map(|b| DistributionLine {
            code: b.code.clone(),
            amount: amount * b.percentage as u64 / 100,
            primary: b.primary,
        })
        .collect();

    let allocated: u64 = lines.iter().map(|l| l.amount).sum();
    let remainder = amount - allocated;
    if remainder > 0 {
        let primary = lines
            .iter_mut()
            .find(|l| l.primary)
            .ok_or(AllocationError::PrimaryCountInvalid { count: 0 })?;
        primary.amount += remainder;
    }

    Ok(lines)
}

/// In-memory store of per-account allocation sets.
///
/// Each mutation runs under the account's map entry, so `set_primary` and
/// friends are atomic per account.
pub struct AllocationStore {
    config: AllocationConfig,
    allocations: DashMap<AccountId, AllocationSet>,
}

impl AllocationStore {
    pub fn new(config: AllocationConfig) -> Self {
        Self {
            config,
            allocations: DashMap::new(),
        }
    }

    /// Replace the account's allocation set. The input must be complete:
    /// percentages summing to exactly 100, binding count within configured
    /// bounds, exactly one primary.
    pub fn set_allocations(
        &self,
        account: AccountId,
        bindings: Vec<CustodianBinding>,
    ) -> Result<(), AllocationError> {
        let set = AllocationSet { bindings };
        set.validate_complete(&self.config)?;
        self.allocations.insert(account, set);
        tracing::info!(account = %account, "Custodian allocations replaced");
        Ok(())
    }

    /// Add one non-primary binding. Rejects if the new total would exceed
    /// 100; the other bindings are not renormalized.
    pub fn add_custodian(
        &self,
        account: AccountId,
        code: &str,
        percentage: u32,
    ) -> Result<(), AllocationError> {
        let mut entry = self
            .allocations
            .get_mut(&account)
            .ok_or_else(|| AllocationError::NoAllocations(account.to_string()))?;

        if entry.find(code).is_some() {
            return Err(AllocationError::DuplicateCustodian(code.to_string()));
        }
        if entry.bindings.len() + 1 > self.config.max_bindings {
            return Err(AllocationError::BindingCountOutOfBounds {
                count: entry.bindings.len() + 1,
                min: self.config.min_bindings,
                max: self.config.max_bindings,
            });
        }
        let total = entry.total() + percentage;
        if total > 100 {
            return Err(AllocationError::WouldExceedTotal { percentage, total });
        }

        entry.bindings.push(CustodianBinding::new(code, percentage));
        Ok(())
    }

    /// Remove a binding. Rejects if the target is primary, or if removal
    /// would leave the total below 100 (the remaining allocations are not
    /// auto-inflated) or the count below the configured minimum.
    pub fn remove_custodian(&self, account: AccountId, code: &str) -> Result<(), AllocationError> {
        let mut entry = self
            .allocations
            .get_mut(&account)
            .ok_or_else(|| AllocationError::NoAllocations(account.to_string()))?;

        let idx = entry
            .find(code)
            .ok_or_else(|| AllocationError::UnknownBinding(code.to_string()))?;

        if entry.bindings[idx].primary {
            return Err(AllocationError::CannotRemovePrimary(code.to_string()));
        }
        let total = entry.total() - entry.bindings[idx].percentage;
        if total < 100 {
            return Err(AllocationError::WouldDropBelowTotal { total });
        }
        if entry.bindings.len() - 1 < self.config.min_bindings {
            return Err(AllocationError::BindingCountOutOfBounds {
                count: entry.bindings.len() - 1,
                min: self.config.min_bindings,
                max: self.config.max_bindings,
            });
        }

        entry.bindings.remove(idx);
        Ok(())
    }

    /// Atomically flip the primary flag from the current primary to `code`
    pub fn set_primary(&self, account: AccountId, code: &str) -> Result<(), AllocationError> {
        let mut entry = self
            .allocations
            .get_mut(&account)
            .ok_or_else(|| AllocationError::NoAllocations(account.to_string()))?;

        let idx = entry
            .find(code)
            .ok_or_else(|| AllocationError::UnknownBinding(code.to_string()))?;

        for binding in entry.bindings.iter_mut() {
            binding.primary = false;
        }
        entry.bindings[idx].primary = true;
        Ok(())
    }

    pub fn get(&self, account: AccountId) -> Result<AllocationSet, AllocationError> {
        self.allocations
            .get(&account)
            .map(|e| e.clone())
            .ok_or_else(|| AllocationError::NoAllocations(account.to_string()))
    }

    /// Pure preview against the account's current set
    pub fn preview(
        &self,
        account: AccountId,
        amount: u64,
    ) -> Result<Vec<DistributionLine>, AllocationError> {
        let set = self.get(account)?;
        preview_distribution(amount, &set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AllocationStore {
        AllocationStore::new(AllocationConfig::default())
    }

    fn three_way() -> Vec<CustodianBinding> {
        vec![
            CustodianBinding::primary("a", 40),
            CustodianBinding::new("b", 30),
            CustodianBinding::new("c", 30),
        ]
    }

    #[test]
    fn test_set_allocations_valid() {
        let store = store();
        let account = AccountId::new();
        store.set_allocations(account, three_way()).unwrap();

        let set = store.get(account).unwrap();
        assert_eq!(set.total(), 100);
        assert_eq!(set.primary_binding().unwrap().code, "a");
    }

    #[test]
    fn test_set_allocations_rejects_bad_total() {
        let store = store();
        let account = AccountId::new();

        let err = store
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("a", 50),
                    CustodianBinding::new("b", 40),
                ],
            )
            .unwrap_err();
        assert_eq!(err, AllocationError::InvalidPercentageTotal { total: 90 });

        let err = store
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("a", 60),
                    CustodianBinding::new("b", 50),
                ],
            )
            .unwrap_err();
        assert_eq!(err, AllocationError::InvalidPercentageTotal { total: 110 });
    }

    #[test]
    fn test_set_allocations_rejects_count_and_primary() {
        let store = store();
        let account = AccountId::new();

        // Single binding is below the minimum
        let err = store
            .set_allocations(account, vec![CustodianBinding::primary("a", 100)])
            .unwrap_err();
        assert!(matches!(
            err,
            AllocationError::BindingCountOutOfBounds { count: 1, .. }
        ));

        // No primary
        let err = store
            .set_allocations(
                account,
                vec![CustodianBinding::new("a", 50), CustodianBinding::new("b", 50)],
            )
            .unwrap_err();
        assert_eq!(err, AllocationError::PrimaryCountInvalid { count: 0 });

        // Two primaries
        let err = store
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("a", 50),
                    CustodianBinding::primary("b", 50),
                ],
            )
            .unwrap_err();
        assert_eq!(err, AllocationError::PrimaryCountInvalid { count: 2 });

        // Duplicate code
        let err = store
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("a", 50),
                    CustodianBinding::new("a", 50),
                ],
            )
            .unwrap_err();
        assert_eq!(err, AllocationError::DuplicateCustodian("a".to_string()));
    }

    #[test]
    fn test_add_rejects_over_100() {
        let store = store();
        let account = AccountId::new();
        store.set_allocations(account, three_way()).unwrap();

        let err = store.add_custodian(account, "d", 5).unwrap_err();
        assert_eq!(
            err,
            AllocationError::WouldExceedTotal {
                percentage: 5,
                total: 105
            }
        );
    }

    #[test]
    fn test_remove_guards() {
        let store = store();
        let account = AccountId::new();
        store.set_allocations(account, three_way()).unwrap();

        // Removing a non-zero binding leaves the total below 100
        let err = store.remove_custodian(account, "b").unwrap_err();
        assert_eq!(err, AllocationError::WouldDropBelowTotal { total: 70 });

        // The primary can never be removed
        let err = store.remove_custodian(account, "a").unwrap_err();
        assert_eq!(err, AllocationError::CannotRemovePrimary("a".to_string()));

        let err = store.remove_custodian(account, "zz").unwrap_err();
        assert_eq!(err, AllocationError::UnknownBinding("zz".to_string()));
    }

    #[test]
    fn test_reconfiguration_flow() {
        let store = store();
        let account = AccountId::new();
        store.set_allocations(account, three_way()).unwrap();

        // A partial set never lands via full replace
        let err = store
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("a", 40),
                    CustodianBinding::new("b", 25),
                    CustodianBinding::new("c", 30),
                ],
            )
            .unwrap_err();
        assert_eq!(err, AllocationError::InvalidPercentageTotal { total: 95 });
        // The previous complete set is untouched
        assert_eq!(store.get(account).unwrap().total(), 100);

        // Rebalancing onto a fourth custodian happens as one full replace
        store
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("a", 40),
                    CustodianBinding::new("b", 25),
                    CustodianBinding::new("c", 30),
                    CustodianBinding::new("d", 5),
                ],
            )
            .unwrap();
        assert_eq!(store.get(account).unwrap().bindings().len(), 4);
        assert_eq!(store.get(account).unwrap().total(), 100);
    }

    #[test]
    fn test_set_primary_atomic_flip() {
        let store = store();
        let account = AccountId::new();
        store.set_allocations(account, three_way()).unwrap();

        store.set_primary(account, "c").unwrap();

        let set = store.get(account).unwrap();
        let primaries: Vec<_> = set.bindings().iter().filter(|b| b.primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].code, "c");
    }

    #[test]
    fn test_preview_exact_split() {
        let store = store();
        let account = AccountId::new();
        store.set_allocations(account, three_way()).unwrap();

        let lines = store.preview(account, 1000).unwrap();
        let by_code = |c: &str| lines.iter().find(|l| l.code == c).unwrap().amount;

        assert_eq!(by_code("a"), 400);
        assert_eq!(by_code("b"), 300);
        assert_eq!(by_code("c"), 300);
        assert_eq!(lines.iter().map(|l| l.amount).sum::<u64>(), 1000);
    }

    #[test]
    fn test_preview_remainder_to_primary() {
        let store = store();
        let account = AccountId::new();
        store
            .set_allocations(
                account,
                vec![
                    CustodianBinding::primary("a", 33),
                    CustodianBinding::new("b", 33),
                    CustodianBinding::new("c", 34),
                ],
            )
            .unwrap();

        // 100 * 33% = 33, 33, 34 -> no remainder
        let lines = store.preview(account, 100).unwrap();
        assert_eq!(lines.iter().map(|l| l.amount).sum::<u64>(), 100);

        // 101: floors are 33, 33, 34 = 100, remainder 1 goes to primary
        let lines = store.preview(account, 101).unwrap();
        assert_eq!(lines.iter().map(|l| l.amount).sum::<u64>(), 101);
        assert_eq!(lines.iter().find(|l| l.primary).unwrap().amount, 34);
    }

    #[test]
    fn test_preview_zero_amount() {
        let store = store();
        let account = AccountId::new();
        store.set_allocations(account, three_way()).unwrap();

        assert_eq!(
            store.preview(account, 0).unwrap_err(),
            AllocationError::InvalidAmount
        );
    }
}
