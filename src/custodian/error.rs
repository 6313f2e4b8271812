//! Resilience Error Types

use thiserror::Error;

use super::connector::ConnectorError;

/// Errors surfaced by the resilience layer after the breaker, retry policy
/// and fallbacks have all had their chance.
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    #[error("Circuit open for custodian {connector}")]
    CircuitOpen { connector: String },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: ConnectorError,
    },

    #[error("Deferred queue full for custodian {connector}")]
    QueueFull { connector: String },

    #[error("Unknown custodian: {0}")]
    UnknownCustodian(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl ResilienceError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ResilienceError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ResilienceError::RetriesExhausted { .. } => "RESILIENCE_TIMEOUT",
            ResilienceError::QueueFull { .. } => "QUEUE_FULL",
            ResilienceError::UnknownCustodian(_) => "UNKNOWN_CUSTODIAN",
            ResilienceError::Connector(ConnectorError::Rejected(_)) => "CUSTODIAN_REJECTED",
            ResilienceError::Connector(_) => "CUSTODIAN_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ResilienceError::CircuitOpen {
                connector: "fnb".to_string()
            }
            .code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(
            ResilienceError::Connector(ConnectorError::Rejected("x".to_string())).code(),
            "CUSTODIAN_REJECTED"
        );
    }
}
