//! In-memory file system for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::fs::FileSystem;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct FileState {
    data: Vec<u8>,
    /// Length covered by the last `sync`.
    synced_len: usize,
}

type SharedFile = Arc<RwLock<FileState>>;

/// An in-memory file system.
///
/// Every handle opened on a path shares the same bytes, so a reader sees
/// what a writer appended. The file system also remembers how much of each
/// file has been synced, which lets tests throw away the unsynced part with
/// [`InMemoryFileSystem::crash`].
///
/// Cloning yields another view of the same files.
///
/// # Example
///
/// ```rust
/// use std::path::Path;
/// use txlog_storage::{FileSystem, InMemoryFileSystem};
///
/// let fs = InMemoryFileSystem::new();
/// let mut file = fs.create(Path::new("log.v0")).unwrap();
/// file.append(b"synced").unwrap();
/// file.sync().unwrap();
/// file.append(b" lost").unwrap();
///
/// let after_crash = fs.crash();
/// assert_eq!(after_crash.file_bytes(Path::new("log.v0")).unwrap(), b"synced");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryFileSystem {
    files: Arc<RwLock<BTreeMap<PathBuf, SharedFile>>>,
}

impl InMemoryFileSystem {
    /// Creates an empty file system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a file's bytes, if the file exists.
    #[must_use]
    pub fn file_bytes(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.read().get(path).map(|f| f.read().data.clone())
    }

    /// Replaces a file's bytes, creating the file if needed.
    ///
    /// The new content counts as synced.
    pub fn put_file(&self, path: &Path, bytes: Vec<u8>) {
        let synced_len = bytes.len();
        let state = FileState {
            data: bytes,
            synced_len,
        };
        self.files
            .write()
            .insert(path.to_path_buf(), Arc::new(RwLock::new(state)));
    }

    /// Returns an independent copy of every file, including unsynced bytes.
    ///
    /// This models a process crash where the operating system survives.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        self.copy_files(|state| state.clone())
    }

    /// Returns an independent copy holding only the synced bytes of every file.
    ///
    /// This models a power loss: whatever was not forced is gone.
    #[must_use]
    pub fn crash(&self) -> Self {
        self.copy_files(|state| FileState {
            data: state.data[..state.synced_len].to_vec(),
            synced_len: state.synced_len,
        })
    }

    fn copy_files(&self, copy: impl Fn(&FileState) -> FileState) -> Self {
        let files = self
            .files
            .read()
            .iter()
            .map(|(path, file)| (path.clone(), Arc::new(RwLock::new(copy(&file.read())))))
            .collect();
        Self {
            files: Arc::new(RwLock::new(files)),
        }
    }

    fn get(&self, path: &Path) -> StorageResult<SharedFile> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::not_found(path))
    }
}

impl FileSystem for InMemoryFileSystem {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        let state = self.get(path)?;
        Ok(Box::new(InMemoryFile { state }))
    }

    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        let state: SharedFile = Arc::default();
        self.files
            .write()
            .insert(path.to_path_buf(), Arc::clone(&state));
        Ok(Box::new(InMemoryFile { state }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn delete(&self, path: &Path) -> StorageResult<()> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        let mut files = self.files.write();
        let state = files
            .remove(from)
            .ok_or_else(|| StorageError::not_found(from))?;
        files.insert(to.to_path_buf(), state);
        Ok(())
    }

    fn list(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn file_size(&self, path: &Path) -> StorageResult<u64> {
        Ok(self.get(path)?.read().data.len() as u64)
    }

    fn create_dir_all(&self, _dir: &Path) -> StorageResult<()> {
        // Directories are implied by file paths.
        Ok(())
    }
}

/// A handle on one file of an [`InMemoryFileSystem`].
#[derive(Debug)]
pub struct InMemoryFile {
    state: SharedFile,
}

impl InMemoryFile {
    /// Returns a copy of all bytes in the file.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.state.read().data.clone()
    }
}

impl StorageBackend for InMemoryFile {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let state = self.state.read();
        let size = state.data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(state.data[offset as usize..end as usize].to_vec())
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let state = self.state.read();
        let size = state.data.len() as u64;
        if offset >= size {
            return Ok(0);
        }
        let start = offset as usize;
        let len = buf.len().min(state.data.len() - start);
        buf[..len].copy_from_slice(&state.data[start..start + len]);
        Ok(len)
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.write();
        let offset = state.data.len() as u64;
        state.data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.read().data.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.synced_len = state.data.len();
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        let size = state.data.len() as u64;

        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }

        state.data.truncate(new_size as usize);
        // Truncation is applied durably, like the OS backend does.
        state.synced_len = state.data.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(name: &str) -> PathBuf {
        Path::new("db").join(name)
    }

    #[test]
    fn memory_append_returns_correct_offset() {
        let fs = InMemoryFileSystem::new();
        let mut file = fs.create(&path("a")).unwrap();

        assert_eq!(file.append(b"hello").unwrap(), 0);
        assert_eq!(file.append(b" world").unwrap(), 5);
        assert_eq!(file.size().unwrap(), 11);
    }

    #[test]
    fn memory_handles_share_bytes() {
        let fs = InMemoryFileSystem::new();
        let mut writer = fs.create(&path("a")).unwrap();
        let reader = fs.open(&path("a")).unwrap();

        writer.append(b"hello").unwrap();
        assert_eq!(reader.read_at(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn memory_read_at_past_end_fails() {
        let fs = InMemoryFileSystem::new();
        let mut file = fs.create(&path("a")).unwrap();
        file.append(b"hello").unwrap();

        let result = file.read_at(3, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn memory_read_into_is_short_at_end() {
        let fs = InMemoryFileSystem::new();
        let mut file = fs.create(&path("a")).unwrap();
        file.append(b"hello").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read_into(2, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"llo");
        assert_eq!(file.read_into(5, &mut buf).unwrap(), 0);
    }

    #[test]
    fn memory_open_missing_fails() {
        let fs = InMemoryFileSystem::new();
        let result = fs.open(&path("missing"));
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn memory_create_truncates_existing() {
        let fs = InMemoryFileSystem::new();
        fs.create(&path("a")).unwrap().append(b"old").unwrap();

        let file = fs.create(&path("a")).unwrap();
        assert_eq!(file.size().unwrap(), 0);
    }

    #[test]
    fn memory_list_only_direct_children() {
        let fs = InMemoryFileSystem::new();
        fs.create(&path("a")).unwrap();
        fs.create(&path("b")).unwrap();
        fs.create(&Path::new("db").join("nested").join("c")).unwrap();

        let mut names = fs.list(Path::new("db")).unwrap();
        names.sort();
        assert_eq!(names, vec![path("a"), path("b")]);
    }

    #[test]
    fn memory_rename_and_delete() {
        let fs = InMemoryFileSystem::new();
        fs.create(&path("a")).unwrap().append(b"x").unwrap();

        fs.rename(&path("a"), &path("b")).unwrap();
        assert!(!fs.exists(&path("a")));
        assert_eq!(fs.file_size(&path("b")).unwrap(), 1);

        fs.delete(&path("b")).unwrap();
        assert!(!fs.exists(&path("b")));
        assert!(fs.delete(&path("b")).is_err());
    }

    #[test]
    fn memory_crash_drops_unsynced_bytes() {
        let fs = InMemoryFileSystem::new();
        let mut file = fs.create(&path("a")).unwrap();
        file.append(b"durable").unwrap();
        file.sync().unwrap();
        file.append(b"volatile").unwrap();

        let crashed = fs.crash();
        assert_eq!(crashed.file_bytes(&path("a")).unwrap(), b"durable");

        let copied = fs.snapshot();
        assert_eq!(copied.file_bytes(&path("a")).unwrap(), b"durablevolatile");
    }

    #[test]
    fn memory_crash_copy_is_independent() {
        let fs = InMemoryFileSystem::new();
        fs.put_file(&path("a"), b"abc".to_vec());

        let copy = fs.crash();
        copy.open(&path("a")).unwrap().append(b"def").unwrap();

        assert_eq!(fs.file_bytes(&path("a")).unwrap(), b"abc");
    }

    #[test]
    fn memory_truncate_to_larger_size_fails() {
        let fs = InMemoryFileSystem::new();
        let mut file = fs.create(&path("a")).unwrap();
        file.append(b"hello").unwrap();

        assert!(matches!(
            file.truncate(100),
            Err(StorageError::InvalidTruncate { .. })
        ));
        file.truncate(2).unwrap();
        assert_eq!(file.read_at(0, 2).unwrap(), b"he");
    }
}
