//! In-memory log channel.

use crate::channel::{PositionAware, ReadableChannel, WritableChannel};
use crate::error::{CodecError, CodecResult};
use crate::position::LogPosition;
use bytes::{BufMut, Bytes, BytesMut};

/// A growable channel held entirely in memory.
///
/// Writes append to the end, reads consume from an independent read cursor.
/// Used for tests and for shipping a handful of transactions without
/// touching a file. Positions reported are those of the read cursor,
/// tagged with the channel's log version.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogChannel {
    buf: BytesMut,
    read_pos: usize,
    log_version: u64,
}

impl InMemoryLogChannel {
    /// Creates an empty channel at log version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty channel that reports positions in `log_version`.
    #[must_use]
    pub fn with_log_version(log_version: u64) -> Self {
        Self {
            log_version,
            ..Self::default()
        }
    }

    /// Creates a channel preloaded with `bytes`, ready to be read.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(bytes),
            ..Self::default()
        }
    }

    /// Returns every byte written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Returns a frozen copy of every byte written so far.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// Returns how many bytes are left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    /// Moves the read cursor back to the start.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }
}

impl WritableChannel for InMemoryLogChannel {
    fn put_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.buf.put_slice(bytes);
        Ok(())
    }
}

impl ReadableChannel for InMemoryLogChannel {
    fn get_bytes(&mut self, out: &mut [u8]) -> CodecResult<()> {
        let available = self.remaining();
        if available < out.len() {
            return Err(CodecError::ReadPastEnd {
                needed: out.len(),
                available,
            });
        }
        out.copy_from_slice(&self.buf[self.read_pos..self.read_pos + out.len()]);
        self.read_pos += out.len();
        Ok(())
    }
}

impl PositionAware for InMemoryLogChannel {
    fn current_position(&self) -> LogPosition {
        LogPosition::new(self.log_version, self.read_pos as u64)
    }
}
