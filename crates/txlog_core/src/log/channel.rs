//! Buffered channels over log files.
//!
//! [`PhysicalWritableChannel`] accumulates writes in memory and hands them to
//! the file in large appends. [`ReadAheadChannel`] reads a log file in large
//! chunks and, when a file runs out, moves on to the next log version through
//! a [`LogVersionBridge`].

use crate::error::CoreResult;
use parking_lot::Mutex;
use std::sync::Arc;
use txlog_codec::{
    CodecError, CodecResult, LogPosition, PositionAware, ReadableChannel, WritableChannel,
    LOG_HEADER_SIZE,
};
use txlog_storage::StorageBackend;

/// A file backend shared between the writer and whoever forces it.
pub type SharedBackend = Arc<Mutex<Box<dyn StorageBackend>>>;

/// Buffered append-only writer for one log file.
///
/// The position it reports includes bytes still sitting in the buffer, so
/// it is exact for every write, including writes that straddle a flush.
pub struct PhysicalWritableChannel {
    backend: SharedBackend,
    log_version: u64,
    buffer: Vec<u8>,
    capacity: usize,
    /// Bytes already handed to the backend.
    written: u64,
}

impl PhysicalWritableChannel {
    /// Creates a writer positioned at the current end of `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: SharedBackend, log_version: u64, capacity: usize) -> CoreResult<Self> {
        let written = backend.lock().size()?;
        let capacity = capacity.max(1);
        Ok(Self {
            backend,
            log_version,
            buffer: Vec::with_capacity(capacity),
            capacity,
            written,
        })
    }

    /// Returns the log version this channel writes to.
    #[must_use]
    pub const fn log_version(&self) -> u64 {
        self.log_version
    }

    /// Returns the position the next byte will be written at.
    #[must_use]
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.log_version, self.written + self.buffer.len() as u64)
    }

    /// Returns the backend this channel writes to.
    #[must_use]
    pub fn backend(&self) -> SharedBackend {
        Arc::clone(&self.backend)
    }

    /// Hands buffered bytes to the file, without forcing them.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the write.
    pub fn write_out(&mut self) -> CoreResult<()> {
        self.drain()?;
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Writes out and then forces the file to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the sync fails.
    pub fn force(&mut self) -> CoreResult<()> {
        self.drain()?;
        let mut backend = self.backend.lock();
        backend.flush()?;
        backend.sync()?;
        Ok(())
    }

    /// Forgets everything written since `offset`, in the buffer and in the
    /// file.
    ///
    /// A failed append may have left part of the buffer in the file beyond
    /// what this channel counts as written; that is cut off too.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be truncated.
    pub fn truncate_to(&mut self, offset: u64) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        if offset >= self.written {
            let keep = usize::try_from(offset - self.written).unwrap_or(usize::MAX);
            self.buffer.truncate(keep);
            if backend.size()? > self.written {
                backend.truncate(self.written)?;
            }
        } else {
            self.buffer.clear();
            backend.truncate(offset)?;
            self.written = offset;
        }
        Ok(())
    }

    fn drain(&mut self) -> txlog_storage::StorageResult<()> {
        if !self.buffer.is_empty() {
            self.backend.lock().append(&self.buffer)?;
            self.written += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }
}

impl WritableChannel for PhysicalWritableChannel {
    fn put_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = self.capacity - self.buffer.len();
            if room == 0 {
                self.drain()?;
                continue;
            }
            let n = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
        }
        Ok(())
    }
}

impl PositionAware for PhysicalWritableChannel {
    fn current_position(&self) -> LogPosition {
        self.position()
    }
}

impl std::fmt::Debug for PhysicalWritableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalWritableChannel")
            .field("position", &self.position())
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// Opens the log version that follows one a reader has exhausted.
pub trait LogVersionBridge: Send + Sync {
    /// Returns the file holding `version + 1`, positioned for reading
    /// entries, or `None` if there is no such version yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the next file exists but cannot be opened or has
    /// an unreadable header.
    fn next(&self, version: u64) -> CodecResult<Option<Box<dyn StorageBackend>>>;
}

/// A bridge that never moves on, confining a reader to one file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNextVersion;

impl LogVersionBridge for NoNextVersion {
    fn next(&self, _version: u64) -> CodecResult<Option<Box<dyn StorageBackend>>> {
        Ok(None)
    }
}

/// Sequential reader over the log with a read-ahead buffer.
///
/// A read that runs past the end of a file continues in the next log
/// version once no bytes of the current file are left, so a caller streams
/// across rotations without noticing them.
pub struct ReadAheadChannel {
    backend: Box<dyn StorageBackend>,
    log_version: u64,
    /// File offset of the byte after the last buffered one.
    file_offset: u64,
    buffer: Vec<u8>,
    pos: usize,
    len: usize,
    bridge: Arc<dyn LogVersionBridge>,
}

impl ReadAheadChannel {
    /// Creates a reader starting at `offset` in `backend`.
    #[must_use]
    pub fn new(
        backend: Box<dyn StorageBackend>,
        start: LogPosition,
        capacity: usize,
        bridge: Arc<dyn LogVersionBridge>,
    ) -> Self {
        Self {
            backend,
            log_version: start.log_version(),
            file_offset: start.byte_offset(),
            buffer: vec![0; capacity.max(LOG_HEADER_SIZE)],
            pos: 0,
            len: 0,
            bridge,
        }
    }

    /// Returns the log version currently being read.
    #[must_use]
    pub const fn log_version(&self) -> u64 {
        self.log_version
    }

    fn buffered(&self) -> usize {
        self.len - self.pos
    }

    fn compact(&mut self, wanted: usize) {
        self.buffer.copy_within(self.pos..self.len, 0);
        self.len -= self.pos;
        self.pos = 0;
        if self.buffer.len() < wanted {
            self.buffer.resize(wanted, 0);
        }
    }

    fn fill(&mut self) -> CodecResult<usize> {
        let read = self
            .backend
            .read_into(self.file_offset, &mut self.buffer[self.len..])?;
        self.len += read;
        self.file_offset += read as u64;
        Ok(read)
    }

    /// Makes at least `wanted` bytes available, bridging if needed.
    fn ensure(&mut self, wanted: usize) -> CodecResult<()> {
        while self.buffered() < wanted {
            self.compact(wanted);
            if self.fill()? > 0 {
                continue;
            }
            // Entries never span files: leftover bytes are a torn tail.
            if self.buffered() > 0 {
                return Err(CodecError::ReadPastEnd {
                    needed: wanted,
                    available: self.buffered(),
                });
            }
            let Some(next) = self.bridge.next(self.log_version)? else {
                return Err(CodecError::ReadPastEnd {
                    needed: wanted,
                    available: 0,
                });
            };
            // The writer may have appended to this file before rotating.
            if self.fill()? > 0 {
                continue;
            }
            self.backend = next;
            self.log_version += 1;
            self.file_offset = LOG_HEADER_SIZE as u64;
        }
        Ok(())
    }
}

impl ReadableChannel for ReadAheadChannel {
    fn get_bytes(&mut self, out: &mut [u8]) -> CodecResult<()> {
        self.ensure(out.len())?;
        out.copy_from_slice(&self.buffer[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }
}

impl PositionAware for ReadAheadChannel {
    fn current_position(&self) -> LogPosition {
        LogPosition::new(self.log_version, self.file_offset - self.buffered() as u64)
    }
}

impl std::fmt::Debug for ReadAheadChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadAheadChannel")
            .field("position", &self.current_position())
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use txlog_storage::{FileSystem, InMemoryFileSystem};

    fn shared(fs: &InMemoryFileSystem, name: &str) -> SharedBackend {
        Arc::new(Mutex::new(fs.create(Path::new(name)).unwrap()))
    }

    struct MapBridge(InMemoryFileSystem);

    impl LogVersionBridge for MapBridge {
        fn next(&self, version: u64) -> CodecResult<Option<Box<dyn StorageBackend>>> {
            let path = format!("log.v{}", version + 1);
            if self.0.exists(Path::new(&path)) {
                Ok(Some(self.0.open(Path::new(&path))?))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn position_counts_buffered_bytes() {
        let fs = InMemoryFileSystem::new();
        let mut channel = PhysicalWritableChannel::new(shared(&fs, "log.v0"), 0, 8).unwrap();

        channel.put_i32(1).unwrap();
        assert_eq!(channel.position(), LogPosition::new(0, 4));
        assert_eq!(fs.file_bytes(Path::new("log.v0")).unwrap().len(), 0);

        // Straddles the 8-byte buffer.
        channel.put_i64(2).unwrap();
        assert_eq!(channel.position(), LogPosition::new(0, 12));
        assert_eq!(fs.file_bytes(Path::new("log.v0")).unwrap().len(), 8);

        channel.write_out().unwrap();
        assert_eq!(fs.file_bytes(Path::new("log.v0")).unwrap().len(), 12);
        assert_eq!(channel.position(), LogPosition::new(0, 12));
    }

    #[test]
    fn truncate_to_drops_buffer_and_file_bytes() {
        let fs = InMemoryFileSystem::new();
        let backend = shared(&fs, "log.v0");
        let mut channel = PhysicalWritableChannel::new(Arc::clone(&backend), 0, 64).unwrap();

        channel.put_bytes(&[1, 2, 3, 4]).unwrap();
        channel.write_out().unwrap();
        channel.put_bytes(&[5, 6]).unwrap();
        channel.put_bytes(&[7, 8, 9]).unwrap();
        // Bytes of an append the channel never counted as written.
        backend.lock().append(&[7, 8]).unwrap();

        channel.truncate_to(6).unwrap();
        assert_eq!(channel.position(), LogPosition::new(0, 6));
        assert_eq!(fs.file_bytes(Path::new("log.v0")).unwrap(), vec![1, 2, 3, 4]);
        channel.write_out().unwrap();
        assert_eq!(fs.file_bytes(Path::new("log.v0")).unwrap(), vec![1, 2, 3, 4, 5, 6]);

        channel.truncate_to(2).unwrap();
        channel.put_bytes(&[0xAA]).unwrap();
        channel.write_out().unwrap();
        assert_eq!(fs.file_bytes(Path::new("log.v0")).unwrap(), vec![1, 2, 0xAA]);
    }

    #[test]
    fn force_survives_crash() {
        let fs = InMemoryFileSystem::new();
        let mut channel = PhysicalWritableChannel::new(shared(&fs, "log.v0"), 0, 64).unwrap();
        channel.put_i64(7).unwrap();
        channel.force().unwrap();
        channel.put_i64(8).unwrap();
        channel.write_out().unwrap();

        let crashed = fs.crash();
        assert_eq!(crashed.file_bytes(Path::new("log.v0")).unwrap(), 7i64.to_be_bytes());
    }

    #[test]
    fn reader_refills_and_resizes() {
        let fs = InMemoryFileSystem::new();
        fs.put_file(Path::new("log.v0"), (0u8..100).collect());
        let backend = fs.open(Path::new("log.v0")).unwrap();
        let mut reader =
            ReadAheadChannel::new(backend, LogPosition::new(0, 10), 4, Arc::new(NoNextVersion));

        let mut big = [0u8; 30];
        reader.get_bytes(&mut big).unwrap();
        assert_eq!(big[0], 10);
        assert_eq!(big[29], 39);
        assert_eq!(reader.current_position(), LogPosition::new(0, 40));
    }

    #[test]
    fn reader_bridges_to_next_version() {
        let fs = InMemoryFileSystem::new();
        let mut first = vec![0u8; LOG_HEADER_SIZE];
        first.extend_from_slice(&1i32.to_be_bytes());
        let mut second = vec![0u8; LOG_HEADER_SIZE];
        second.extend_from_slice(&2i32.to_be_bytes());
        fs.put_file(Path::new("log.v0"), first);
        fs.put_file(Path::new("log.v1"), second);

        let backend = fs.open(Path::new("log.v0")).unwrap();
        let mut reader = ReadAheadChannel::new(
            backend,
            LogPosition::start_of(0),
            64,
            Arc::new(MapBridge(fs.clone())),
        );

        assert_eq!(reader.get_i32().unwrap(), 1);
        assert_eq!(reader.get_i32().unwrap(), 2);
        assert_eq!(reader.current_position(), LogPosition::new(1, 20));
        assert!(reader.get_u8().unwrap_err().is_read_past_end());
    }

    #[test]
    fn reader_sees_growth_of_live_file() {
        let fs = InMemoryFileSystem::new();
        let mut writer = fs.create(Path::new("log.v0")).unwrap();
        writer.append(&[1, 2]).unwrap();

        let backend = fs.open(Path::new("log.v0")).unwrap();
        let mut reader =
            ReadAheadChannel::new(backend, LogPosition::new(0, 0), 16, Arc::new(NoNextVersion));
        assert_eq!(reader.get_u8().unwrap(), 1);
        assert_eq!(reader.get_u8().unwrap(), 2);
        assert!(reader.get_u8().is_err());

        writer.append(&[3]).unwrap();
        assert_eq!(reader.get_u8().unwrap(), 3);
    }

    #[test]
    fn torn_tail_does_not_bridge() {
        let fs = InMemoryFileSystem::new();
        fs.put_file(Path::new("log.v0"), vec![0; LOG_HEADER_SIZE + 2]);
        fs.put_file(Path::new("log.v1"), vec![0; LOG_HEADER_SIZE + 8]);

        let backend = fs.open(Path::new("log.v0")).unwrap();
        let mut reader = ReadAheadChannel::new(
            backend,
            LogPosition::start_of(0),
            64,
            Arc::new(MapBridge(fs.clone())),
        );
        assert!(reader.get_i32().unwrap_err().is_read_past_end());
        assert_eq!(reader.log_version(), 0);
    }
}
