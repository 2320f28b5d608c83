//! Storage backend trait definition.

use crate::error::StorageResult;

/// An open file, seen as an append-only byte store.
///
/// Backends are **opaque byte stores**. The log layers its header and
/// entry framing on top; backends never interpret what they hold.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` makes every appended byte survive a crash
/// - Bytes appended through one handle are visible to other handles on
///   the same file once `append` returns
///
/// # Implementors
///
/// - [`super::InMemoryFile`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()`
    /// only when the end of the file was reached. Reading at or beyond
    /// the end returns 0.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let size = self.size()?;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let len = available.min(buf.len());
        let data = self.read_at(offset, len)?;
        buf[..len].copy_from_slice(&data);
        Ok(len)
    }

    /// Appends data to the end of the file.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered bytes down to the operating system.
    ///
    /// This does not make the data durable, see [`StorageBackend::sync`].
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the file in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Forces all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the file to the given size.
    ///
    /// Used by recovery to cut a torn tail off the newest log file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The truncation fails
    /// - `new_size` is greater than current size
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
