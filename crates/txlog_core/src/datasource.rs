//! The log data source: opening, recovering and closing one log.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::extract::{LogicalTransactionStore, TransactionCursor};
use crate::log::{LogFile, LogFiles, ShutdownMarker};
use crate::store::Collaborators;
use crate::transaction::{
    Forcer, IdOrderingQueue, TransactionAppender, TransactionCommitProcess,
    TransactionMetadataCache, TransactionRepresentation,
};
use crate::types::TransactionId;
use crate::xa::{recovery, RecoveryReport, ResourceManager};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use txlog_codec::LogPosition;
use txlog_storage::{FileSystem, OsFileSystem};

/// A transaction log and everything that writes to or reads from it.
///
/// `DataSource` is the entry point for a store that keeps its changes in a
/// txlog log. Opening one:
///
/// 1. Removes rotation files a crash left half-written
/// 2. Opens the newest log version, or creates the first one
/// 3. Replays the newest version and resolves what was in flight
/// 4. Marks the log as in use until [`DataSource::close`]
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use txlog_core::{Collaborators, Config, DataSource, TransactionIdStore};
///
/// let store = Arc::new(TransactionIdStore::default());
/// let ds = DataSource::open_dir("graph.db", "nioneo_logical.log", Config::default(),
///     Collaborators::with_id_store(store, applier))?;
///
/// let tx_id = ds.commit(&transaction)?;
/// ds.close()?;
/// ```
///
/// Dropping an open data source closes it.
pub struct DataSource {
    name: String,
    files: LogFiles,
    log: Arc<LogFile>,
    forcer: Arc<Forcer>,
    collaborators: Collaborators,
    appender: Arc<TransactionAppender>,
    commit_process: TransactionCommitProcess,
    resource_manager: ResourceManager,
    transactions: LogicalTransactionStore,
    recovery: Option<RecoveryReport>,
    is_open: RwLock<bool>,
}

impl DataSource {
    /// Opens the log named `name` in `dir` on the OS file system.
    ///
    /// # Errors
    ///
    /// See [`DataSource::open`].
    pub fn open_dir(
        dir: impl AsRef<Path>,
        name: &str,
        config: Config,
        collaborators: Collaborators,
    ) -> CoreResult<Self> {
        Self::open(
            Arc::new(OsFileSystem::new()),
            dir.as_ref(),
            name,
            config,
            collaborators,
        )
    }

    /// Opens the log named `name` in `dir`, recovering it if it was not
    /// closed cleanly.
    ///
    /// `name` is both the base name of the log files and the data source
    /// name reported to the id generator.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or log files cannot be accessed,
    /// the newest header is unreadable, or [`CoreError::Recovery`] if the
    /// log cannot be replayed.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        dir: impl Into<PathBuf>,
        name: &str,
        config: Config,
        collaborators: Collaborators,
    ) -> CoreResult<Self> {
        let dir = dir.into();
        fs.create_dir_all(&dir)?;
        let files = LogFiles::new(fs, dir, name);

        let removed = files.remove_temp_files()?;
        if removed > 0 {
            info!(removed, "removed half-written rotation files");
        }
        let marker = files.read_marker()?;
        debug!(?marker, "read shutdown marker");

        let cache = Arc::new(TransactionMetadataCache::new(
            config.tx_cache_size,
            config.header_cache_size,
        ));
        let force_mode = config.force_mode;
        let log = Arc::new(LogFile::open(
            files.clone(),
            config,
            Arc::clone(&collaborators.durability),
            cache,
        )?);
        let forcer = Arc::new(Forcer::new(force_mode, Arc::clone(&log))?);
        let legacy_index_order = Arc::new(IdOrderingQueue::new());
        let resource_manager = ResourceManager::new(
            name,
            Arc::clone(&log),
            Arc::clone(&forcer),
            Arc::clone(&legacy_index_order),
            collaborators.clone(),
        );

        files.write_marker(false)?;

        // The scan also tells the writer which ids and identifiers the log
        // already holds, so it runs after a clean shutdown too.
        let report = recovery::recover(&log, &resource_manager, &collaborators, name)?;
        let recovery = if marker == ShutdownMarker::Clean {
            None
        } else {
            warn!(?marker, "log was not closed cleanly, recovered");
            Some(report)
        };

        let appender = Arc::new(TransactionAppender::new(
            name,
            Arc::clone(&log),
            Arc::clone(&collaborators.generator),
            Arc::clone(&forcer),
            legacy_index_order,
        ));
        let commit_process = TransactionCommitProcess::new(
            Arc::clone(&appender),
            Arc::clone(&collaborators.applier),
            Arc::clone(&collaborators.durability),
        );
        let transactions = LogicalTransactionStore::new(Arc::clone(&log));

        info!(
            name,
            version = log.current_version(),
            last_tx_id = log.last_written_tx_id(),
            "opened log"
        );

        Ok(Self {
            name: name.to_string(),
            files,
            log,
            forcer,
            collaborators,
            appender,
            commit_process,
            resource_manager,
            transactions,
            recovery,
            is_open: RwLock::new(true),
        })
    }

    /// Returns the data source name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the log files.
    #[must_use]
    pub fn files(&self) -> &LogFiles {
        &self.files
    }

    /// Returns the log.
    #[must_use]
    pub fn log(&self) -> &Arc<LogFile> {
        &self.log
    }

    /// Returns the appender.
    #[must_use]
    pub fn appender(&self) -> &Arc<TransactionAppender> {
        &self.appender
    }

    /// Returns the commit process.
    #[must_use]
    pub fn commit_process(&self) -> &TransactionCommitProcess {
        &self.commit_process
    }

    /// Returns the resource manager for coordinated transactions.
    #[must_use]
    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    /// Returns the store of committed transactions.
    #[must_use]
    pub fn transactions(&self) -> &LogicalTransactionStore {
        &self.transactions
    }

    /// Returns what recovery did on open, or `None` if the log had been
    /// closed cleanly.
    #[must_use]
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Returns the id of the last transaction in the log.
    #[must_use]
    pub fn last_committed_tx(&self) -> TransactionId {
        TransactionId::new(self.log.last_written_tx_id())
    }

    /// Commits a locally built transaction through the commit process.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`DataSource::close`], otherwise
    /// whatever [`TransactionCommitProcess::commit`] returns.
    pub fn commit(&self, transaction: &TransactionRepresentation) -> CoreResult<TransactionId> {
        self.ensure_open()?;
        self.commit_process.commit(transaction)
    }

    /// Opens a cursor yielding committed transactions from `start` on.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`DataSource::close`], or
    /// [`CoreError::NoSuchTransaction`] if `start` is not in the log.
    pub fn get_cursor(&self, start: TransactionId) -> CoreResult<TransactionCursor> {
        self.ensure_open()?;
        self.transactions.get_cursor(start)
    }

    /// Rotates if the active file has outgrown the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`DataSource::close`], or the
    /// rotation error.
    pub fn check_rotation(&self) -> CoreResult<bool> {
        self.ensure_open()?;
        self.log.check_rotation()
    }

    /// Rotates the log now and returns the position writing continues at.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`DataSource::close`], or the
    /// rotation error.
    pub fn rotate(&self) -> CoreResult<LogPosition> {
        self.ensure_open()?;
        self.log.rotate()
    }

    /// Closes the data source.
    ///
    /// The log is forced and the store flushed. The log is marked clean only
    /// if nothing is in flight; otherwise the next open recovers it.
    ///
    /// # Errors
    ///
    /// Returns an error if forcing, flushing or writing the marker fails.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }

        self.log.close()?;
        self.collaborators.durability.flush_all()?;

        let in_flight = self.log.writer().in_flight_count();
        if in_flight == 0 && self.resource_manager.is_empty() {
            self.files.write_marker(true)?;
        } else {
            warn!(
                in_flight,
                tracked = self.resource_manager.len(),
                "closing with transactions in flight, log stays marked dirty"
            );
        }

        self.forcer.shutdown();
        *is_open = false;
        info!(name = %self.name, "closed log");
        Ok(())
    }

    /// Checks if the data source is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::Closed)
        }
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("is_open", &self.is_open())
            .field("version", &self.log.current_version())
            .field("last_committed_tx", &self.last_committed_tx())
            .finish_non_exhaustive()
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(name = %self.name, error = %e, "closing log on drop failed");
        }
        self.forcer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ApplyMode, TransactionApplier, TransactionIdStore};
    use crate::types::new_xid;
    use crate::xa::PrepareOutcome;
    use parking_lot::Mutex;
    use txlog_codec::{Command, NodeCommand};
    use txlog_storage::InMemoryFileSystem;

    #[derive(Debug, Default)]
    struct Applied(Mutex<Vec<(u64, ApplyMode)>>);

    impl TransactionApplier for Applied {
        fn apply(
            &self,
            tx_id: TransactionId,
            _transaction: &TransactionRepresentation,
            mode: ApplyMode,
        ) -> CoreResult<()> {
            self.0.lock().push((tx_id.as_u64(), mode));
            Ok(())
        }
    }

    fn open(fs: &InMemoryFileSystem, applied: &Arc<Applied>) -> DataSource {
        DataSource::open(
            Arc::new(fs.clone()),
            "db",
            "log",
            Config::default(),
            Collaborators::with_id_store(
                Arc::new(TransactionIdStore::default()),
                applied.clone(),
            ),
        )
        .unwrap()
    }

    fn tx(id: u64) -> TransactionRepresentation {
        TransactionRepresentation::new(vec![Command::Node(NodeCommand {
            id,
            before: None,
            after: None,
        })])
    }

    #[test]
    fn clean_close_skips_recovery() {
        let fs = InMemoryFileSystem::new();
        let applied = Arc::new(Applied::default());
        {
            let ds = open(&fs, &applied);
            assert!(ds.recovery_report().is_some());
            for i in 1..=3 {
                assert_eq!(ds.commit(&tx(i)).unwrap(), TransactionId::new(i));
            }
            ds.close().unwrap();
            assert!(!ds.is_open());
            assert!(matches!(ds.commit(&tx(4)), Err(CoreError::Closed)));
        }
        assert_eq!(fs.file_bytes(Path::new("db/log.active")).unwrap(), b"\0\0\0C");

        let ds = open(&fs, &applied);
        assert!(ds.recovery_report().is_none());
        assert_eq!(ds.last_committed_tx(), TransactionId::new(3));
        assert_eq!(ds.commit(&tx(4)).unwrap(), TransactionId::new(4));
    }

    #[test]
    fn open_marks_log_dirty() {
        let fs = InMemoryFileSystem::new();
        let applied = Arc::new(Applied::default());
        let _ds = open(&fs, &applied);
        assert_eq!(fs.file_bytes(Path::new("db/log.active")).unwrap(), b"\0\0\0D");
    }

    #[test]
    fn crash_recovers_committed_transactions() {
        let fs = InMemoryFileSystem::new();
        let applied = Arc::new(Applied::default());
        let ds = open(&fs, &applied);
        for i in 1..=3 {
            ds.commit(&tx(i)).unwrap();
        }
        let crashed = fs.crash();

        let recovered = Arc::new(Applied::default());
        let ds2 = open(&crashed, &recovered);
        let report = ds2.recovery_report().unwrap().clone();
        assert_eq!(report.entries, 12);
        assert_eq!(report.last_tx_id, 3);
        assert_eq!(report.truncated_bytes, 0);
        assert!(report.resolution.recommitted.is_empty());
        assert_eq!(ds2.commit(&tx(4)).unwrap(), TransactionId::new(4));

        let ids: Vec<u64> = ds2
            .get_cursor(TransactionId::new(1))
            .unwrap()
            .map(|t| t.unwrap().commit.tx_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        drop(ds);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let fs = InMemoryFileSystem::new();
        let applied = Arc::new(Applied::default());
        let ds = open(&fs, &applied);
        ds.commit(&tx(1)).unwrap();
        let crashed = fs.crash();
        drop(ds);

        let path = Path::new("db/log.v0");
        let mut bytes = crashed.file_bytes(path).unwrap();
        let intact = bytes.len();
        bytes.extend_from_slice(&[1, 0, 0]);
        crashed.put_file(path, bytes);

        let ds = open(&crashed, &applied);
        assert_eq!(ds.recovery_report().unwrap().truncated_bytes, 3);
        assert_eq!(crashed.file_bytes(path).unwrap().len(), intact);
        assert_eq!(ds.commit(&tx(2)).unwrap(), TransactionId::new(2));
    }

    #[test]
    fn start_without_commit_is_rolled_back() {
        let fs = InMemoryFileSystem::new();
        let applied = Arc::new(Applied::default());
        let ds = open(&fs, &applied);
        ds.commit(&tx(1)).unwrap();
        {
            let mut writer = ds.log().writer();
            let identifier = writer.next_identifier();
            writer
                .write_start(identifier, new_xid("log"), &tx(2))
                .unwrap();
            writer
                .write_command(identifier, &tx(2).commands()[0])
                .unwrap();
            writer.force().unwrap();
        }
        let crashed = fs.crash();
        drop(ds);

        let ds = open(&crashed, &applied);
        let report = ds.recovery_report().unwrap();
        assert_eq!(report.entries, 6);
        assert_eq!(report.resolution.rolled_back, 1);
        assert_eq!(ds.last_committed_tx(), TransactionId::new(1));
        ds.close().unwrap();

        let ds = open(&crashed, &applied);
        assert!(ds.recovery_report().is_none());
    }

    #[test]
    fn recovery_is_idempotent() {
        let fs = InMemoryFileSystem::new();
        let applied = Arc::new(Applied::default());
        let ds = open(&fs, &applied);
        for i in 1..=2 {
            ds.commit(&tx(i)).unwrap();
        }
        let crashed = fs.crash();
        drop(ds);

        let first = open(&crashed, &applied);
        let first_report = first.recovery_report().unwrap().clone();
        let again = crashed.crash();
        drop(first);

        let second = open(&again, &applied);
        let second_report = second.recovery_report().unwrap();
        assert_eq!(second_report.last_tx_id, first_report.last_tx_id);
        assert_eq!(second_report.entries, first_report.entries);
        assert_eq!(second_report.resolution, first_report.resolution);
    }

    #[test]
    fn prepared_transaction_stays_in_doubt() {
        let fs = InMemoryFileSystem::new();
        let applied = Arc::new(Applied::default());
        let ds = open(&fs, &applied);
        let xid = new_xid("log");
        ds.resource_manager().start(xid.clone(), tx(1)).unwrap();
        assert_eq!(
            ds.resource_manager().prepare(&xid).unwrap(),
            PrepareOutcome::Prepared
        );
        let crashed = fs.crash();
        drop(ds);

        let recovered = Arc::new(Applied::default());
        let ds = open(&crashed, &recovered);
        assert_eq!(
            ds.recovery_report().unwrap().resolution.in_doubt,
            vec![xid.clone()]
        );
        assert_eq!(ds.resource_manager().recover(), vec![xid.clone()]);

        assert_eq!(
            ds.resource_manager().commit(&xid, false).unwrap(),
            Some(TransactionId::new(1))
        );
        assert_eq!(*recovered.0.lock(), vec![(1, ApplyMode::Internal)]);
        assert!(ds.resource_manager().is_empty());
    }

    #[test]
    fn close_with_transaction_in_doubt_leaves_log_dirty() {
        let fs = InMemoryFileSystem::new();
        let applied = Arc::new(Applied::default());
        let ds = open(&fs, &applied);
        let xid = new_xid("log");
        ds.resource_manager().start(xid.clone(), tx(1)).unwrap();
        ds.resource_manager().prepare(&xid).unwrap();
        ds.close().unwrap();
        assert_eq!(fs.file_bytes(Path::new("db/log.active")).unwrap(), b"\0\0\0D");
    }

    #[test]
    fn open_dir_reopens_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let applied = Arc::new(Applied::default());
        let collaborators = || {
            Collaborators::with_id_store(Arc::new(TransactionIdStore::default()), applied.clone())
        };
        {
            let ds = DataSource::open_dir(dir.path(), "log", Config::default(), collaborators())
                .unwrap();
            ds.commit(&tx(1)).unwrap();
            ds.close().unwrap();
        }
        assert!(dir.path().join("log.v0").exists());

        let ds =
            DataSource::open_dir(dir.path(), "log", Config::default(), collaborators()).unwrap();
        assert!(ds.recovery_report().is_none());
        assert_eq!(ds.last_committed_tx(), TransactionId::new(1));
        assert_eq!(ds.commit(&tx(2)).unwrap(), TransactionId::new(2));
    }
}
