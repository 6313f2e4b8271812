//! Custodian Resilience Layer
//!
//! Circuit breaker, retry policy and fallback routing around every
//! outbound custodian call. Connectors themselves (bank-specific protocol
//! translation) live outside this crate behind [`CustodianConnector`].

pub mod breaker;
pub mod connector;
pub mod error;
pub mod registry;
pub mod resilient;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use connector::{ConnectorError, CustodianConnector, CustodianOperation, Receipt};
pub use error::ResilienceError;
pub use registry::CustodianRegistry;
pub use resilient::{CallOutcome, ResilientCustodian};
pub use retry::RetryPolicy;
