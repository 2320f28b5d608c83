//! # txlog Core
//!
//! The write-ahead log of an embedded transactional graph store.
//!
//! This crate provides:
//! - [`LogFile`] - the versioned log files, rotation and pruning
//! - [`TransactionAppender`] - appends local and shipped transactions
//! - [`TransactionCommitProcess`] - appends, then applies to the store
//! - [`ResourceManager`] - two-phase commit keyed by xid
//! - [`LogicalTransactionStore`] - cursors over committed transactions
//! - [`DataSource`] - opens, recovers and closes one log
//!
//! The store side is reached through the traits in [`store`]: the log asks
//! for transaction ids, reports commits and closes, and hands committed
//! commands to an applier.
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use txlog_codec::{Command, NodeCommand};
//! use txlog_core::{
//!     ApplyMode, Collaborators, Config, CoreResult, DataSource, TransactionApplier,
//!     TransactionId, TransactionIdStore, TransactionRepresentation,
//! };
//! use txlog_storage::InMemoryFileSystem;
//!
//! #[derive(Debug)]
//! struct Discard;
//!
//! impl TransactionApplier for Discard {
//!     fn apply(&self, _: TransactionId, _: &TransactionRepresentation, _: ApplyMode) -> CoreResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! let collaborators =
//!     Collaborators::with_id_store(Arc::new(TransactionIdStore::default()), Arc::new(Discard));
//! let ds = DataSource::open(
//!     Arc::new(InMemoryFileSystem::new()),
//!     "graph.db",
//!     "nioneo_logical.log",
//!     Config::default(),
//!     collaborators,
//! )
//! .unwrap();
//!
//! let command = Command::Node(NodeCommand { id: 1, before: None, after: None });
//! let tx_id = ds.commit(&TransactionRepresentation::new(vec![command])).unwrap();
//! assert_eq!(tx_id, TransactionId::new(1));
//! ds.close().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod datasource;
mod error;
mod extract;
mod log;
pub mod store;
mod transaction;
mod types;
mod xa;

pub use config::{Config, ForceMode};
pub use datasource::DataSource;
pub use error::{CoreError, CoreResult};
pub use extract::{LogicalTransactionStore, TransactionCursor};
pub use log::{
    LogFile, LogFileInformation, LogFiles, LogPruneStrategy, LogVersionBridge, LogWriter,
    NoNextVersion, PhysicalWritableChannel, ReadAheadChannel, ReaderLogVersionBridge,
    SharedBackend, ShutdownMarker, WriterMark,
};
pub use store::{
    ApplyMode, Collaborators, StoreDurability, TransactionApplier, TransactionIdGenerator,
    TransactionIdStore,
};
pub use transaction::{
    BatchingForcer, CommittedTransactionRepresentation, Forcer, IdOrderingQueue,
    TransactionAppender, TransactionCommitProcess, TransactionMetadata, TransactionMetadataCache,
    TransactionRepresentation,
};
pub use types::{current_time_millis, new_xid, TransactionId, XID_FORMAT_ID};
pub use xa::{PrepareOutcome, RecoveryReport, Resolution, ResourceManager, TransactionState};
