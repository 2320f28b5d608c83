//! Naming and bookkeeping of the log files in a directory.
//!
//! ```text
//! <dir>/<base>.v0        log version 0
//! <dir>/<base>.v1        log version 1
//! <dir>/<base>.v2.tmp    version 2 while rotation is preparing it
//! <dir>/<base>.active    clean shutdown marker
//! ```

use crate::error::{CoreError, CoreResult};
use crate::log::channel::LogVersionBridge;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use txlog_codec::{CodecError, CodecResult, LogHeader, LOG_HEADER_SIZE};
use txlog_storage::{FileSystem, StorageBackend, StorageError};

const MARKER_CLEAN: u32 = b'C' as u32;
const MARKER_DIRTY: u32 = b'D' as u32;

/// What the shutdown marker says about the last session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMarker {
    /// The log was closed cleanly.
    Clean,
    /// The log was open, or the marker is unreadable.
    Dirty,
    /// No marker has ever been written.
    Missing,
}

/// The set of log files sharing a base name in one directory.
#[derive(Debug, Clone)]
pub struct LogFiles {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    base_name: String,
}

impl LogFiles {
    /// Creates a view of the log files named `base_name` in `dir`.
    pub fn new(fs: Arc<dyn FileSystem>, dir: impl Into<PathBuf>, base_name: impl Into<String>) -> Self {
        Self {
            fs,
            dir: dir.into(),
            base_name: base_name.into(),
        }
    }

    /// Returns the file system.
    #[must_use]
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Returns the directory holding the logs.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the base name.
    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Returns the path of a log version.
    #[must_use]
    pub fn version_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}.v{version}", self.base_name))
    }

    pub(crate) fn temp_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}.v{version}.tmp", self.base_name))
    }

    /// Returns the path of the shutdown marker.
    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(format!("{}.active", self.base_name))
    }

    fn parse_version(&self, path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(&self.base_name)?.strip_prefix(".v")?;
        rest.parse().ok()
    }

    /// Returns every existing log version, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn versions(&self) -> CoreResult<Vec<u64>> {
        let mut versions: Vec<u64> = self
            .fs
            .list(&self.dir)?
            .iter()
            .filter_map(|p| self.parse_version(p))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Returns the highest existing log version.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn highest_version(&self) -> CoreResult<Option<u64>> {
        Ok(self.versions()?.last().copied())
    }

    /// Returns the lowest existing log version.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn lowest_version(&self) -> CoreResult<Option<u64>> {
        Ok(self.versions()?.first().copied())
    }

    /// Returns whether a log version exists.
    #[must_use]
    pub fn exists(&self, version: u64) -> bool {
        self.fs.exists(&self.version_path(version))
    }

    /// Opens a log version for reading.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchLogVersion`] if the file does not exist.
    pub fn open(&self, version: u64) -> CoreResult<Box<dyn StorageBackend>> {
        self.fs
            .open(&self.version_path(version))
            .map_err(|e| match e {
                StorageError::NotFound { .. } => CoreError::NoSuchLogVersion { version },
                other => other.into(),
            })
    }

    /// Returns the size of a log version in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchLogVersion`] if the file does not exist.
    pub fn size(&self, version: u64) -> CoreResult<u64> {
        self.fs
            .file_size(&self.version_path(version))
            .map_err(|e| match e {
                StorageError::NotFound { .. } => CoreError::NoSuchLogVersion { version },
                other => other.into(),
            })
    }

    /// Reads the header of a log version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchLogVersion`] for a missing file,
    /// [`CoreError::IllegalLogFormat`] for an unsupported format and
    /// [`CoreError::ReadPastEnd`] for a file shorter than a header.
    pub fn read_header(&self, version: u64, strict: bool) -> CoreResult<LogHeader> {
        let backend = self.open(version)?;
        Ok(read_header(backend.as_ref(), version, strict)?)
    }

    /// Deletes a log version.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be deleted.
    pub fn delete(&self, version: u64) -> CoreResult<()> {
        self.fs.delete(&self.version_path(version))?;
        Ok(())
    }

    /// Deletes half-prepared rotation files left by a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or a file cannot
    /// be deleted.
    pub fn remove_temp_files(&self) -> CoreResult<usize> {
        let prefix = format!("{}.v", self.base_name);
        let mut removed = 0;
        for path in self.fs.list(&self.dir)? {
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".tmp"));
            if is_temp {
                debug!(path = %path.display(), "removing stale rotation file");
                self.fs.delete(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Reads the shutdown marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker exists but cannot be read.
    pub fn read_marker(&self) -> CoreResult<ShutdownMarker> {
        let path = self.marker_path();
        if !self.fs.exists(&path) {
            return Ok(ShutdownMarker::Missing);
        }
        let backend = self.fs.open(&path)?;
        if backend.size()? < 4 {
            return Ok(ShutdownMarker::Dirty);
        }
        let bytes = backend.read_at(0, 4)?;
        let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(if value == MARKER_CLEAN {
            ShutdownMarker::Clean
        } else {
            ShutdownMarker::Dirty
        })
    }

    /// Writes and syncs the shutdown marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn write_marker(&self, clean: bool) -> CoreResult<()> {
        let value = if clean { MARKER_CLEAN } else { MARKER_DIRTY };
        let mut backend = self.fs.create(&self.marker_path())?;
        backend.append(&value.to_be_bytes())?;
        backend.sync()?;
        Ok(())
    }
}

fn read_header(backend: &dyn StorageBackend, version: u64, strict: bool) -> CodecResult<LogHeader> {
    let bytes = backend.read_at(0, LOG_HEADER_SIZE).map_err(|e| match e {
        StorageError::ReadPastEnd { size, .. } => CodecError::ReadPastEnd {
            needed: LOG_HEADER_SIZE,
            available: usize::try_from(size).unwrap_or(usize::MAX),
        },
        other => other.into(),
    })?;
    let mut raw = [0u8; LOG_HEADER_SIZE];
    raw.copy_from_slice(&bytes);
    let header = LogHeader::decode(&raw, strict)?;
    if header.log_version != version {
        return Err(CodecError::invalid_structure(format!(
            "log file for version {version} has header for version {}",
            header.log_version
        )));
    }
    Ok(header)
}

/// Bridges readers to the next log version after checking its header.
#[derive(Debug, Clone)]
pub struct ReaderLogVersionBridge {
    files: LogFiles,
    strict: bool,
}

impl ReaderLogVersionBridge {
    /// Creates a bridge over `files`.
    #[must_use]
    pub const fn new(files: LogFiles, strict: bool) -> Self {
        Self { files, strict }
    }
}

impl LogVersionBridge for ReaderLogVersionBridge {
    fn next(&self, version: u64) -> CodecResult<Option<Box<dyn StorageBackend>>> {
        let next = version + 1;
        let path = self.files.version_path(next);
        if !self.files.fs.exists(&path) {
            return Ok(None);
        }
        let backend = self.files.fs.open(&path)?;
        read_header(backend.as_ref(), next, self.strict)?;
        Ok(Some(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txlog_storage::InMemoryFileSystem;

    fn files() -> (InMemoryFileSystem, LogFiles) {
        let fs = InMemoryFileSystem::new();
        let files = LogFiles::new(Arc::new(fs.clone()), "db", "nioneo_logical.log");
        (fs, files)
    }

    fn put_log(fs: &InMemoryFileSystem, files: &LogFiles, version: u64, prev: u64) {
        let header = LogHeader::new(version, prev).encode().unwrap();
        fs.put_file(&files.version_path(version), header.to_vec());
    }

    #[test]
    fn naming() {
        let (_, files) = files();
        assert_eq!(files.version_path(3), PathBuf::from("db/nioneo_logical.log.v3"));
        assert_eq!(files.marker_path(), PathBuf::from("db/nioneo_logical.log.active"));
    }

    #[test]
    fn versions_are_sorted_and_filtered() {
        let (fs, files) = files();
        put_log(&fs, &files, 10, 0);
        put_log(&fs, &files, 2, 0);
        fs.put_file(&files.temp_path(11), Vec::new());
        fs.put_file(Path::new("db/other.v1"), Vec::new());

        assert_eq!(files.versions().unwrap(), vec![2, 10]);
        assert_eq!(files.highest_version().unwrap(), Some(10));
        assert_eq!(files.lowest_version().unwrap(), Some(2));
    }

    #[test]
    fn header_is_checked_against_version() {
        let (fs, files) = files();
        put_log(&fs, &files, 4, 99);
        assert_eq!(files.read_header(4, true).unwrap().last_committed_tx_id, 99);

        fs.rename(&files.version_path(4), &files.version_path(5)).unwrap();
        assert!(files.read_header(5, false).is_err());
        assert!(matches!(
            files.read_header(4, false),
            Err(CoreError::NoSuchLogVersion { version: 4 })
        ));
    }

    #[test]
    fn short_header_is_read_past_end() {
        let (fs, files) = files();
        fs.put_file(&files.version_path(0), vec![0; 5]);
        assert!(files.read_header(0, false).unwrap_err().is_read_past_end());
    }

    #[test]
    fn marker_states() {
        let (fs, files) = files();
        assert_eq!(files.read_marker().unwrap(), ShutdownMarker::Missing);
        files.write_marker(false).unwrap();
        assert_eq!(files.read_marker().unwrap(), ShutdownMarker::Dirty);
        files.write_marker(true).unwrap();
        assert_eq!(files.read_marker().unwrap(), ShutdownMarker::Clean);

        fs.put_file(&files.marker_path(), vec![0, 0]);
        assert_eq!(files.read_marker().unwrap(), ShutdownMarker::Dirty);
    }

    #[test]
    fn temp_files_are_removed() {
        let (fs, files) = files();
        put_log(&fs, &files, 0, 0);
        fs.put_file(&files.temp_path(1), vec![1, 2, 3]);
        assert_eq!(files.remove_temp_files().unwrap(), 1);
        assert_eq!(files.versions().unwrap(), vec![0]);
    }

    #[test]
    fn bridge_opens_next_version() {
        let (fs, files) = files();
        put_log(&fs, &files, 0, 0);
        let bridge = ReaderLogVersionBridge::new(files.clone(), false);
        assert!(bridge.next(0).unwrap().is_none());

        put_log(&fs, &files, 1, 5);
        assert!(bridge.next(0).unwrap().is_some());
    }
}
