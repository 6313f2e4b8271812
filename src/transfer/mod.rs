//! Transfer Orchestration
//!
//! Two-account atomic movement built as a saga over the event-sourced
//! ledger: debit the source, credit the destination, and compensate the
//! debit when the credit leg fails.

pub mod error;
pub mod orchestrator;
pub mod state;
pub mod types;

pub use error::TransferError;
pub use orchestrator::TransferOrchestrator;
pub use state::TransferStatus;
pub use types::{CompensationOutcome, TransferId, TransferRecord, TransferRequest};
