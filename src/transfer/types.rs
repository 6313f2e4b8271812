//! Transfer Core Types

use std::fmt;
use std::str::FromStr;

use super::state::TransferStatus;
use crate::core_types::{AccountId, AssetId, CorrelationId};

/// Transfer ID - ULID-based unique identifier
///
/// Using ULID provides:
/// - Monotonic, sortable IDs
/// - No coordination needed between instances
/// - 128-bit with good entropy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(ulid::Ulid);

impl TransferId {
    /// Generate a new unique TransferId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Get the inner ULID value
    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Transfer request from the API layer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Source account (debited)
    pub source: AccountId,
    /// Destination account (credited)
    pub destination: AccountId,
    /// Asset being moved
    pub asset: AssetId,
    /// Amount in minor units
    pub amount: u64,
    /// Client-provided human reference, also the idempotency key
    pub reference: Option<String>,
}

impl TransferRequest {
    pub fn new(source: AccountId, destination: AccountId, asset: AssetId, amount: u64) -> Self {
        Self {
            source,
            destination,
            asset,
            amount,
            reference: None,
        }
    }

    /// Create request with a client reference (idempotency key)
    pub fn with_reference(
        source: AccountId,
        destination: AccountId,
        asset: AssetId,
        amount: u64,
        reference: String,
    ) -> Self {
        Self {
            source,
            destination,
            asset,
            amount,
            reference: Some(reference),
        }
    }
}

/// What happened to the debit after the credit leg failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// The reversing credit restored the source balance
    Compensated,
    /// Even the reversing credit failed; escalated for manual operator
    /// intervention
    Escalated(String),
}

/// One logical movement between two accounts
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: TransferId,
    pub source: AccountId,
    pub destination: AccountId,
    pub asset: AssetId,
    pub amount: u64,
    pub status: TransferStatus,
    /// Client-provided human reference
    pub reference: Option<String>,
    /// Links the debit/credit event pair in the ledger
    pub correlation_id: CorrelationId,
    /// Originating error kind when status is `Failed`
    pub error: Option<String>,
    /// Set when the compensation path ran
    pub compensation: Option<CompensationOutcome>,
    /// Created timestamp (millis)
    pub created_at: i64,
    /// Last updated timestamp (millis)
    pub updated_at: i64,
}

impl TransferRecord {
    /// Create a new record in PENDING state
    pub fn new(id: TransferId, req: &TransferRequest) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id,
            source: req.source,
            destination: req.destination,
            asset: req.asset,
            amount: req.amount,
            status: TransferStatus::Pending,
            reference: req.reference.clone(),
            correlation_id: CorrelationId::new(),
            error: None,
            compensation: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer[{}] {} -> {} asset={} amount={} status={}",
            self.id, self.source, self.destination, self.asset, self.amount, self.status
        )
    }
}
