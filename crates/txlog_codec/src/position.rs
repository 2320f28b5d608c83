//! Positions in the logical log stream.

use std::fmt;

/// A pointer into the version-spanning log stream.
///
/// Ordered by log version first and byte offset second, so positions in a
/// later file always compare greater than positions in an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition {
    log_version: u64,
    byte_offset: u64,
}

impl LogPosition {
    /// Creates a position.
    #[must_use]
    pub const fn new(log_version: u64, byte_offset: u64) -> Self {
        Self {
            log_version,
            byte_offset,
        }
    }

    /// Returns the position of the first entry in a log file.
    #[must_use]
    pub const fn start_of(log_version: u64) -> Self {
        Self::new(log_version, crate::header::LOG_HEADER_SIZE as u64)
    }

    /// Returns the log version.
    #[must_use]
    pub const fn log_version(self) -> u64 {
        self.log_version
    }

    /// Returns the byte offset within the log file.
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.byte_offset
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}@{}", self.log_version, self.byte_offset)
    }
}
