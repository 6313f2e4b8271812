//! Custodian Connector Contract
//!
//! One uniform capability interface per external custodian bank. The
//! bank-specific protocol translation lives behind this trait in external
//! connector crates; this core only sees `execute(operation)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core_types::AssetId;

/// Operation routed to a custodian rail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CustodianOperation {
    /// Push funds into the custodian-held account
    Deposit {
        account_ref: String,
        asset: AssetId,
        amount: u64,
    },
    /// Pull funds out of the custodian-held account
    Withdraw {
        account_ref: String,
        asset: AssetId,
        amount: u64,
    },
    /// Read the custodian-side balance
    BalanceCheck { account_ref: String, asset: AssetId },
    /// Pay a net settlement amount to another custodian.
    /// `reference` is the idempotency key: a custodian receiving the same
    /// reference twice must not move funds twice.
    Settle {
        reference: String,
        counterparty: String,
        asset: AssetId,
        amount: u64,
    },
}

impl CustodianOperation {
    /// Operation name for logging and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CustodianOperation::Deposit { .. } => "deposit",
            CustodianOperation::Withdraw { .. } => "withdraw",
            CustodianOperation::BalanceCheck { .. } => "balance_check",
            CustodianOperation::Settle { .. } => "settle",
        }
    }

    /// Reads may be served from the last-known-good cache; writes may not
    pub fn is_read(&self) -> bool {
        matches!(self, CustodianOperation::BalanceCheck { .. })
    }

    /// Cache key for read operations
    pub fn cache_key(&self) -> Option<String> {
        match self {
            CustodianOperation::BalanceCheck { account_ref, asset } => {
                Some(format!("balance:{}:{}", account_ref, asset))
            }
            _ => None,
        }
    }
}

/// Confirmation returned by a custodian for an executed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Custodian-side confirmation reference
    pub reference: String,
    /// Populated for balance checks
    pub value: Option<u64>,
    pub timestamp_ms: i64,
}

impl Receipt {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            value: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_value(reference: impl Into<String>, value: u64) -> Self {
        Self {
            reference: reference.into(),
            value: Some(value),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Connector-level errors, classified for the retry policy
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Custodian call timed out")]
    Timeout,

    #[error("Custodian unavailable: {0}")]
    Unavailable(String),

    /// Business rejection (invalid account, limits, compliance hold).
    /// Never retried: the call reached the custodian and was refused.
    #[error("Custodian rejected operation: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ConnectorError {
    /// Transient errors are retried per policy and count against the
    /// circuit breaker; rejections do neither.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::Timeout | ConnectorError::Unavailable(_)
        )
    }
}

/// Uniform custodian capability interface.
///
/// Implementations are selected by configuration and wrapped by the
/// resilience layer regardless of provider.
#[async_trait]
pub trait CustodianConnector: Send + Sync {
    /// Stable connector code (e.g. "fnb", "meridian-trust")
    fn code(&self) -> &str;

    /// Execute one operation against the custodian rail
    async fn execute(&self, op: CustodianOperation) -> Result<Receipt, ConnectorError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_classification() {
        let read = CustodianOperation::BalanceCheck {
            account_ref: "acc-1".to_string(),
            asset: 1,
        };
        let write = CustodianOperation::Withdraw {
            account_ref: "acc-1".to_string(),
            asset: 1,
            amount: 100,
        };

        assert!(read.is_read());
        assert!(read.cache_key().is_some());
        assert!(!write.is_read());
        assert!(write.cache_key().is_none());
    }

    #[test]
    fn test_error_classification() {
        assert!(ConnectorError::Timeout.is_transient());
        assert!(ConnectorError::Unavailable("503".to_string()).is_transient());
        assert!(!ConnectorError::Rejected("bad account".to_string()).is_transient());
        assert!(!ConnectorError::Protocol("bad frame".to_string()).is_transient());
    }

    #[tokio::test]
    async fn test_mock_scripted_then_default() {
        use mock::MockConnector;

        let connector = MockConnector::new("fnb");
        connector.push_outcome(Err(ConnectorError::Timeout));

        let op = CustodianOperation::BalanceCheck {
            account_ref: "a".to_string(),
            asset: 1,
        };

        assert!(connector.execute(op.clone()).await.is_err());
        assert!(connector.execute(op).await.is_ok());
        assert_eq!(connector.call_count(), 2);
    }
}
