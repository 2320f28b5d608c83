//! Error types for the codec crate.

use thiserror::Error;
use txlog_storage::StorageError;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The channel ran out of bytes before a value was complete.
    ///
    /// This is the normal way to find the tail of a log that is still being
    /// written, not a sign of corruption.
    #[error("read past end: needed {needed} bytes, {available} available")]
    ReadPastEnd {
        /// Bytes the read asked for.
        needed: usize,
        /// Bytes that were left.
        available: usize,
    },

    /// An entry started with a type byte this reader does not know.
    #[error("unknown log entry type {type_byte}")]
    UnknownEntryType {
        /// The offending byte.
        type_byte: u8,
    },

    /// An entry carried a version byte this reader does not know.
    #[error("unknown log entry version {version_byte:#04x}")]
    UnknownEntryVersion {
        /// The offending byte.
        version_byte: u8,
    },

    /// A command started with a type byte this reader does not know.
    #[error("unknown command type {type_byte}")]
    UnknownCommandType {
        /// The offending byte.
        type_byte: u8,
    },

    /// A log header carried an unsupported format version.
    #[error("illegal log format: expected version {expected}, found {found}")]
    IllegalLogFormat {
        /// The format version this reader expects.
        expected: u8,
        /// The format version found in the header.
        found: u8,
    },

    /// Bytes decoded into a value that violates its layout rules.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// The underlying file failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CodecError {
    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Returns `true` for the benign end-of-available-data condition.
    #[must_use]
    pub fn is_read_past_end(&self) -> bool {
        matches!(
            self,
            Self::ReadPastEnd { .. } | Self::Storage(StorageError::ReadPastEnd { .. })
        )
    }
}
