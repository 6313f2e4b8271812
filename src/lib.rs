//! Meridian Core - Multi-tenant core-banking ledger and settlement core
//!
//! Money movement is recorded as an immutable event log, balances are a
//! replayable projection of it, transfers are a two-leg saga with
//! compensation, and custodian traffic goes through a circuit-breaking
//! resilience layer with periodic inter-custodian settlement.
//!
//! # Modules
//!
//! - [`core_types`] - Core identifier types (AccountId, AssetId, etc.)
//! - [`money`] - Minor-unit amount parsing and formatting
//! - [`ledger`] - Event-sourced account ledger and balance projection
//! - [`transfer`] - Two-account transfer orchestration (saga)
//! - [`custodian`] - Circuit breaker, retry and fallback around custodians
//! - [`allocation`] - Per-account custodian percentage allocations
//! - [`settlement`] - Periodic inter-custodian netting
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod logging;
pub mod money;

// Ledger core
pub mod ledger;

// Movement layers
pub mod allocation;
pub mod custodian;
pub mod settlement;
pub mod transfer;

// Convenient re-exports at crate root
pub use allocation::{AllocationStore, BankDistributor, CustodianBinding};
pub use config::AppConfig;
pub use core_types::{AccountId, AssetId, CorrelationId, OwnerId, SeqNum};
pub use custodian::{
    CircuitBreaker, CircuitState, CustodianConnector, CustodianOperation, CustodianRegistry,
    Receipt, ResilientCustodian,
};
pub use ledger::{
    AccountState, BalanceProjection, EventRecord, EventStore, Ledger, LedgerError, LedgerEvent,
    MemoryEventStore,
};
pub use settlement::{SettlementBatch, SettlementEngine, SettlementMode};
pub use transfer::{TransferOrchestrator, TransferRecord, TransferRequest, TransferStatus};
