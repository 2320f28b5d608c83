//! Error types for the txlog core.

use std::io;
use std::time::Duration;
use thiserror::Error;
use txlog_codec::{CodecError, Xid};
use txlog_storage::StorageError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in txlog core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Log entry codec error.
    #[error("codec error: {0}")]
    Codec(CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The end of the currently available log data was reached.
    ///
    /// Benign: it marks the tail of a log that is still being written.
    #[error("read past end of log: needed {needed} bytes, {available} available")]
    ReadPastEnd {
        /// Bytes the read asked for.
        needed: usize,
        /// Bytes that were available.
        available: usize,
    },

    /// A log file was written in a format this build does not read.
    #[error("illegal log format: expected {expected}, found {found}")]
    IllegalLogFormat {
        /// Format this build writes.
        expected: u8,
        /// Format found in the file.
        found: u8,
    },

    /// The requested transaction is not in the log (pruned or never written).
    #[error("no such transaction: {tx_id}")]
    NoSuchTransaction {
        /// The requested transaction id.
        tx_id: u64,
    },

    /// The requested log version does not exist (pruned or never written).
    #[error("no such log version: {version}")]
    NoSuchLogVersion {
        /// The requested log version.
        version: u64,
    },

    /// A transaction id appeared out of sequence.
    #[error("unexpected transaction id: expected {expected}, got {actual}")]
    UnexpectedTransactionId {
        /// The id that should have come next.
        expected: u64,
        /// The id that was found.
        actual: u64,
    },

    /// An externally committed transaction arrived ahead of its predecessors.
    #[error("out of order apply: expected transaction {expected}, got {actual}")]
    OutOfOrderApply {
        /// The id that should have come next.
        expected: u64,
        /// The id that was offered.
        actual: u64,
    },

    /// Appending a transaction failed; nothing of it is committed.
    #[error("failed to append transaction {tx_id}: {source}")]
    TransactionAppendFailure {
        /// The transaction id, or -1 if none was assigned yet.
        tx_id: i64,
        /// The underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Recovery could not complete.
    #[error("recovery failed in log version {log_version} at offset {offset}: {source}")]
    Recovery {
        /// Log file recovery gave up in.
        log_version: u64,
        /// Byte offset of the entry it gave up on.
        offset: u64,
        /// The underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Rotation gave up waiting for open transactions to close.
    #[error("log rotation timed out after {waited:?} waiting for transactions up to {awaited} to close")]
    RotationTimeout {
        /// How long rotation waited.
        waited: Duration,
        /// Highest transaction id rotation was waiting on.
        awaited: u64,
    },

    /// The resource manager knows nothing about this xid.
    #[error("unknown xid: {xid:?}")]
    UnknownXid {
        /// The xid.
        xid: Xid,
    },

    /// An internal invariant was broken by the caller.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Description of the violated invariant.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The data source has been closed.
    #[error("data source is closed")]
    Closed,
}

impl CoreError {
    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Wraps a failure during append with the best known transaction id.
    pub fn append_failure(tx_id: Option<u64>, source: CoreError) -> Self {
        if let Self::TransactionAppendFailure { .. } = source {
            return source;
        }
        Self::TransactionAppendFailure {
            tx_id: tx_id.map_or(-1, |id| id as i64),
            source: Box::new(source),
        }
    }

    /// Wraps a failure during recovery with the place it happened.
    pub fn recovery(log_version: u64, offset: u64, source: CoreError) -> Self {
        Self::Recovery {
            log_version,
            offset,
            source: Box::new(source),
        }
    }

    /// Returns whether this is the benign end-of-data condition.
    #[must_use]
    pub fn is_read_past_end(&self) -> bool {
        match self {
            Self::ReadPastEnd { .. } => true,
            Self::Codec(e) => e.is_read_past_end(),
            Self::Storage(StorageError::ReadPastEnd { .. }) => true,
            _ => false,
        }
    }
}

impl From<CodecError> for CoreError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::ReadPastEnd { needed, available } => Self::ReadPastEnd { needed, available },
            CodecError::IllegalLogFormat { expected, found } => {
                Self::IllegalLogFormat { expected, found }
            }
            CodecError::Storage(storage) => Self::Storage(storage),
            other => Self::Codec(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_read_past_end_is_folded() {
        let err: CoreError = CodecError::ReadPastEnd {
            needed: 8,
            available: 3,
        }
        .into();
        assert!(matches!(err, CoreError::ReadPastEnd { needed: 8, available: 3 }));
        assert!(err.is_read_past_end());
    }

    #[test]
    fn storage_read_past_end_is_benign() {
        let err = CoreError::Storage(StorageError::ReadPastEnd {
            offset: 10,
            len: 4,
            size: 12,
        });
        assert!(err.is_read_past_end());
        assert!(!CoreError::Closed.is_read_past_end());
    }

    #[test]
    fn append_failure_carries_unassigned_id() {
        let err = CoreError::append_failure(None, CoreError::illegal_state("boom"));
        match err {
            CoreError::TransactionAppendFailure { tx_id, source } => {
                assert_eq!(tx_id, -1);
                assert!(matches!(*source, CoreError::IllegalState { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn append_failure_is_not_wrapped_twice() {
        let inner = CoreError::append_failure(Some(4), CoreError::Closed);
        let outer = CoreError::append_failure(None, inner);
        assert!(matches!(outer, CoreError::TransactionAppendFailure { tx_id: 4, .. }));
    }

    #[test]
    fn error_display() {
        let err = CoreError::recovery(3, 120, CoreError::illegal_state("bad"));
        assert_eq!(
            err.to_string(),
            "recovery failed in log version 3 at offset 120: illegal state: bad"
        );
    }
}
