//! Inter-Custodian Settlement
//!
//! Net positions between custodian banks are accumulated as internal
//! accounting entries and periodically collapsed into one settlement
//! instruction per pair.

pub mod batch;
pub mod engine;

pub use batch::{BatchEntry, BatchId, BatchStatus, CustodianPair, SettlementBatch};
pub use engine::{SettlementEngine, SettlementError, SettlementMode};
