//! Log file header.
//!
//! Every log file starts with a fixed 16-byte prologue:
//!
//! ```text
//! | format version (1) | log version (7) | previous committed tx id (8) |
//! ```
//!
//! The format version is packed into the top byte of the first big-endian
//! `u64`; the remaining 56 bits hold the log version.

use crate::channel::{ReadableChannel, WritableChannel};
use crate::error::{CodecError, CodecResult};

/// Size of the header in bytes.
pub const LOG_HEADER_SIZE: usize = 16;

/// The log format version written by this crate.
pub const CURRENT_LOG_FORMAT_VERSION: u8 = 5;

/// Largest log version that fits in the header.
pub const MAX_LOG_VERSION: u64 = (1 << 56) - 1;

/// Decoded log file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Format version of the file.
    pub format_version: u8,
    /// Version of this log file.
    pub log_version: u64,
    /// Id of the last transaction committed before this file was started.
    pub last_committed_tx_id: u64,
}

impl LogHeader {
    /// Creates a header in the current format.
    #[must_use]
    pub const fn new(log_version: u64, last_committed_tx_id: u64) -> Self {
        Self {
            format_version: CURRENT_LOG_FORMAT_VERSION,
            log_version,
            last_committed_tx_id,
        }
    }

    /// Encodes the header.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidStructure`] if the log version does not
    /// fit in 56 bits.
    pub fn encode(&self) -> CodecResult<[u8; LOG_HEADER_SIZE]> {
        if self.log_version > MAX_LOG_VERSION {
            return Err(CodecError::invalid_structure(format!(
                "log version {} does not fit in the header",
                self.log_version
            )));
        }
        let packed = (u64::from(self.format_version) << 56) | self.log_version;
        let mut bytes = [0u8; LOG_HEADER_SIZE];
        bytes[..8].copy_from_slice(&packed.to_be_bytes());
        bytes[8..].copy_from_slice(&(self.last_committed_tx_id as i64).to_be_bytes());
        Ok(bytes)
    }

    /// Decodes a header.
    ///
    /// A format newer than [`CURRENT_LOG_FORMAT_VERSION`] is always rejected;
    /// in `strict` mode anything but an exact match is.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::IllegalLogFormat`] as described above.
    pub fn decode(bytes: &[u8; LOG_HEADER_SIZE], strict: bool) -> CodecResult<Self> {
        let mut packed = [0u8; 8];
        packed.copy_from_slice(&bytes[..8]);
        let packed = u64::from_be_bytes(packed);
        let mut last = [0u8; 8];
        last.copy_from_slice(&bytes[8..]);

        let format_version = (packed >> 56) as u8;
        let illegal = if strict {
            format_version != CURRENT_LOG_FORMAT_VERSION
        } else {
            format_version > CURRENT_LOG_FORMAT_VERSION
        };
        if illegal {
            return Err(CodecError::IllegalLogFormat {
                expected: CURRENT_LOG_FORMAT_VERSION,
                found: format_version,
            });
        }

        Ok(Self {
            format_version,
            log_version: packed & MAX_LOG_VERSION,
            last_committed_tx_id: i64::from_be_bytes(last) as u64,
        })
    }

    /// Writes the header to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the channel fails.
    pub fn write_to<C: WritableChannel + ?Sized>(&self, channel: &mut C) -> CodecResult<()> {
        channel.put_bytes(&self.encode()?)
    }

    /// Reads a header from a channel.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ReadPastEnd`] for a short file, otherwise see
    /// [`LogHeader::decode`].
    pub fn read_from<C: ReadableChannel + ?Sized>(channel: &mut C, strict: bool) -> CodecResult<Self> {
        let mut bytes = [0u8; LOG_HEADER_SIZE];
        channel.get_bytes(&mut bytes)?;
        Self::decode(&bytes, strict)
    }
}
