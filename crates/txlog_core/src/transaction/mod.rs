//! Transactions: their representation, the commit path and its helpers.

mod appender;
mod commit_process;
mod force;
mod metadata_cache;
mod ordering;
mod representation;

pub use appender::TransactionAppender;
pub use commit_process::TransactionCommitProcess;
pub use force::{BatchingForcer, Forcer};
pub use metadata_cache::{TransactionMetadata, TransactionMetadataCache};
pub use ordering::IdOrderingQueue;
pub use representation::{CommittedTransactionRepresentation, TransactionRepresentation};
