//! # txlog Codec
//!
//! Binary framing for the txlog transaction log.
//!
//! This crate knows how bytes are laid out and nothing about files,
//! rotation or transactions in flight:
//!
//! - [`WritableChannel`] / [`ReadableChannel`] - big-endian typed puts and gets
//! - [`InMemoryLogChannel`] - a channel held in memory
//! - [`LogHeader`] - the 16-byte prologue of every log file
//! - [`LogEntry`] - Start, Prepare, Command, Commit and Done entries
//! - [`Command`] - the store mutations carried by Command entries
//!
//! ## Usage
//!
//! ```
//! use txlog_codec::{read_log_entry, write_log_entry, InMemoryLogChannel, LogEntry};
//!
//! let mut channel = InMemoryLogChannel::new();
//! write_log_entry(&mut channel, &LogEntry::Done { identifier: 7 }).unwrap();
//!
//! let decoded = read_log_entry(&mut channel).unwrap().unwrap();
//! assert_eq!(decoded.entry, LogEntry::Done { identifier: 7 });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod command;
mod entry;
mod error;
mod header;
mod memory;
mod position;

pub use channel::{PositionAware, ReadableChannel, WritableChannel};
pub use command::{
    command_type, Command, DynamicRecord, IndexEntityType, LegacyIndexAction, LegacyIndexCommand,
    NeoStoreCommand, NodeCommand, NodeRecord, PropertyBlock, PropertyCommand, PropertyOwner,
    PropertyRecord, RelationshipCommand, RelationshipGroupCommand, RelationshipGroupRecord,
    RelationshipRecord, SchemaRuleCommand, TokenCommand, TokenRecord, MAX_FIELD_LENGTH,
};
pub use entry::{
    entry_type, read_log_entry, write_command_entry, write_log_entry, write_versioned_log_entry,
    CommitEntry, LogEntry, LogEntryVersion, StartEntry, VersionedLogEntry, Xid, MAX_XID_PART,
};
pub use error::{CodecError, CodecResult};
pub use header::{LogHeader, CURRENT_LOG_FORMAT_VERSION, LOG_HEADER_SIZE, MAX_LOG_VERSION};
pub use memory::InMemoryLogChannel;
pub use position::LogPosition;
