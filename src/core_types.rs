//! Core types used throughout the system
//!
//! Fundamental identifiers shared by all modules. They provide semantic
//! meaning and enable future type evolution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Asset ID - globally unique identifier for an asset.
///
/// # Constraints:
/// - **Immutable**: Once assigned, NEVER changes
/// - **Small Values**: Enables O(1) direct array indexing
/// - **Sequential**: Assigned contiguously (0, 1, 2, ...)
pub type AssetId = u32;

/// Owner ID - tenant/user reference owning an account.
///
/// Assigned by the (out-of-scope) identity layer; opaque here.
pub type OwnerId = u64;

/// Account ID - opaque unique identifier for a ledger account.
///
/// UUIDv4: no coordination needed between instances, and the value leaks
/// nothing about account ordering or volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Generate a new unique AccountId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Correlation ID - links the events and records produced by one logical
/// operation (e.g. the debit/credit pair of a transfer).
///
/// Used for audit reconstruction, not for concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Sequence number for per-aggregate event ordering (1-based, contiguous)
pub type SeqNum = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_unique() {
        let a = AccountId::new();
        let b = AccountId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_account_id_roundtrip() {
        let id = AccountId::new();
        let parsed: AccountId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_correlation_id_roundtrip() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
