//! Coordinated transactions and crash recovery.

pub(crate) mod recovery;
mod resource_manager;

pub use recovery::RecoveryReport;
pub use resource_manager::{PrepareOutcome, ResourceManager, Resolution, TransactionState};
