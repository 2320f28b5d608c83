//! File system abstraction.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// The set of file operations the log is allowed to perform.
///
/// Everything above this trait is deterministic given a file system, which
/// is what lets the recovery and rotation tests run against
/// [`super::InMemoryFileSystem`] and then simulate a crash.
pub trait FileSystem: Send + Sync + Debug {
    /// Opens an existing file for reading and appending.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if the file does not exist.
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;

    /// Creates a file, truncating it if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns whether a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Deletes a file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if the file does not exist.
    fn delete(&self, path: &Path) -> StorageResult<()>;

    /// Renames a file, replacing `to` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if `from` does not exist.
    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Lists the files directly inside `dir`.
    ///
    /// A missing directory lists as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list(&self, dir: &Path) -> StorageResult<Vec<PathBuf>>;

    /// Returns the size of the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if the file does not exist.
    fn file_size(&self, path: &Path) -> StorageResult<u64>;

    /// Creates `dir` and all of its parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn create_dir_all(&self, dir: &Path) -> StorageResult<()>;
}
