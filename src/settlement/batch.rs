//! Settlement Batch Types

use std::fmt;
use std::str::FromStr;

use crate::core_types::AssetId;

/// Batch ID - ULID-based unique identifier, sortable by creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(ulid::Ulid);

impl BatchId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Batch lifecycle. `Settled` batches are never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum BatchStatus {
    Open = 0,
    Closing = 10,
    Settled = 20,
}

impl BatchStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Settled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "OPEN",
            BatchStatus::Closing => "CLOSING",
            BatchStatus::Settled => "SETTLED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unordered custodian pair, normalized so (x, y) and (y, x) are the same
/// key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustodianPair {
    pub a: String,
    pub b: String,
}

impl CustodianPair {
    pub fn new(x: &str, y: &str) -> Self {
        if x <= y {
            Self {
                a: x.to_string(),
                b: y.to_string(),
            }
        } else {
            Self {
                a: y.to_string(),
                b: x.to_string(),
            }
        }
    }

    pub fn key(&self) -> String {
        format!("{}|{}", self.a, self.b)
    }
}

impl fmt::Display for CustodianPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.a, self.b)
    }
}

/// One netted position inside a batch.
///
/// `net > 0` means `pair.a` pays `pair.b`; `net < 0` the other way.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub pair: CustodianPair,
    pub asset: AssetId,
    pub net: i64,
    /// Below the minimum settlement amount: carried forward, not settled
    pub carried: bool,
    /// Idempotency key of the issued instruction, when one was issued
    pub instruction_key: Option<String>,
    pub error: Option<String>,
}

/// Snapshot of net obligations between custodian pairs for one period
#[derive(Debug, Clone)]
pub struct SettlementBatch {
    pub id: BatchId,
    pub period_start_ms: i64,
    pub period_end_ms: i64,
    pub entries: Vec<BatchEntry>,
    pub status: BatchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_normalization() {
        let p1 = CustodianPair::new("fnb", "alpha");
        let p2 = CustodianPair::new("alpha", "fnb");
        assert_eq!(p1, p2);
        assert_eq!(p1.key(), "alpha|fnb");
    }

    #[test]
    fn test_batch_status() {
        assert!(!BatchStatus::Open.is_terminal());
        assert!(!BatchStatus::Closing.is_terminal());
        assert!(BatchStatus::Settled.is_terminal());
        assert_eq!(BatchStatus::Closing.to_string(), "CLOSING");
    }

    #[test]
    fn test_batch_id_roundtrip() {
        let id = BatchId::new();
        let parsed: BatchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
