//! Test fixtures and log helpers.
//!
//! Provides recording collaborators, logs opened on an in-memory or a
//! temporary directory, and builders for common transactions.

use crate::crash::CrashKind;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use txlog_codec::{
    Command, IndexEntityType, LegacyIndexAction, LegacyIndexCommand, NodeCommand, NodeRecord,
};
use txlog_core::{
    ApplyMode, Collaborators, Config, CoreError, CoreResult, DataSource, TransactionApplier,
    TransactionId, TransactionIdStore, TransactionRepresentation,
};
use txlog_storage::{InMemoryFileSystem, OsFileSystem};

/// Directory the test logs live in.
pub const TEST_DIR: &str = "graph.db";

/// Base name of the test logs.
pub const TEST_LOG_NAME: &str = "nioneo_logical.log";

/// One call the store applier received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransaction {
    /// The transaction id.
    pub tx_id: TransactionId,
    /// Why it was applied.
    pub mode: ApplyMode,
    /// Number of commands.
    pub commands: usize,
    /// Whether it changed a legacy index.
    pub legacy_index: bool,
}

/// An applier that records what it is asked to apply.
#[derive(Debug, Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<AppliedTransaction>>,
    fail_next: AtomicBool,
}

impl RecordingApplier {
    /// Creates an empty applier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded call, in call order.
    #[must_use]
    pub fn applied(&self) -> Vec<AppliedTransaction> {
        self.applied.lock().clone()
    }

    /// Returns the applied ids, in call order.
    #[must_use]
    pub fn tx_ids(&self) -> Vec<u64> {
        self.applied.lock().iter().map(|a| a.tx_id.as_u64()).collect()
    }

    /// Returns the ids applied in `mode`, in call order.
    #[must_use]
    pub fn tx_ids_in(&self, mode: ApplyMode) -> Vec<u64> {
        self.applied
            .lock()
            .iter()
            .filter(|a| a.mode == mode)
            .map(|a| a.tx_id.as_u64())
            .collect()
    }

    /// Returns the ids of legacy index transactions, in call order.
    #[must_use]
    pub fn legacy_index_order(&self) -> Vec<u64> {
        self.applied
            .lock()
            .iter()
            .filter(|a| a.legacy_index)
            .map(|a| a.tx_id.as_u64())
            .collect()
    }

    /// Makes the next call fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Forgets every recorded call.
    pub fn clear(&self) {
        self.applied.lock().clear();
    }
}

impl TransactionApplier for RecordingApplier {
    fn apply(
        &self,
        tx_id: TransactionId,
        transaction: &TransactionRepresentation,
        mode: ApplyMode,
    ) -> CoreResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CoreError::illegal_state(format!(
                "simulated store failure applying {tx_id}"
            )));
        }
        self.applied.lock().push(AppliedTransaction {
            tx_id,
            mode,
            commands: transaction.len(),
            legacy_index: transaction.has_legacy_index_changes(),
        });
        Ok(())
    }
}

/// A log on an in-memory file system, with its collaborators.
///
/// Every open starts from a fresh [`TransactionIdStore`], so what the store
/// knows after a reopen comes from the log alone.
pub struct TestLog {
    /// The data source.
    pub ds: DataSource,
    /// The file system the log lives on.
    pub fs: InMemoryFileSystem,
    /// The id generator and durability hooks.
    pub store: Arc<TransactionIdStore>,
    /// The store applier.
    pub applier: Arc<RecordingApplier>,
    config: Config,
}

impl TestLog {
    /// Opens a log with the default configuration.
    pub fn memory() -> Self {
        Self::with_config(Config::default())
    }

    /// Opens a log with `config`.
    pub fn with_config(config: Config) -> Self {
        Self::open_on(InMemoryFileSystem::new(), config).expect("Failed to open in-memory log")
    }

    /// Opens the log found on `fs`, recovering it if needed.
    ///
    /// # Errors
    ///
    /// Returns whatever [`DataSource::open`] returns.
    pub fn open_on(fs: InMemoryFileSystem, config: Config) -> CoreResult<Self> {
        let store = Arc::new(TransactionIdStore::default());
        let applier = Arc::new(RecordingApplier::new());
        let ds = DataSource::open(
            Arc::new(fs.clone()),
            TEST_DIR,
            TEST_LOG_NAME,
            config.clone(),
            Collaborators::with_id_store(Arc::clone(&store), applier.clone()),
        )?;
        Ok(Self {
            ds,
            fs,
            store,
            applier,
            config,
        })
    }

    /// Opens a second log on what survives `kind` of crash of this one.
    ///
    /// This log is left as it is.
    pub fn reopen_after(&self, kind: CrashKind) -> Self {
        Self::open_on(kind.survivors(&self.fs), self.config.clone())
            .expect("Failed to reopen log after crash")
    }

    /// Returns the configuration the log was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the path of a log version.
    #[must_use]
    pub fn version_path(&self, version: u64) -> PathBuf {
        self.ds.files().version_path(version)
    }

    /// Reads every committed transaction id back through a cursor.
    pub fn committed_tx_ids(&self) -> Vec<u64> {
        if self.ds.last_committed_tx().as_u64() == 0 {
            return Vec::new();
        }
        self.ds
            .get_cursor(TransactionId::new(1))
            .expect("Failed to open cursor")
            .map(|tx| tx.expect("Failed to read transaction").commit.tx_id)
            .collect()
    }
}

impl std::ops::Deref for TestLog {
    type Target = DataSource;

    fn deref(&self) -> &Self::Target {
        &self.ds
    }
}

/// A log in a temporary directory on the OS file system.
pub struct TestDirLog {
    /// The data source.
    pub ds: DataSource,
    /// The store applier.
    pub applier: Arc<RecordingApplier>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: TempDir,
}

impl TestDirLog {
    /// Opens a log in a new temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::open_in(temp_dir, Config::default()).expect("Failed to open file log")
    }

    fn open_in(temp_dir: TempDir, config: Config) -> CoreResult<Self> {
        let applier = Arc::new(RecordingApplier::new());
        let ds = DataSource::open(
            Arc::new(OsFileSystem::new()),
            temp_dir.path(),
            TEST_LOG_NAME,
            config,
            Collaborators::with_id_store(
                Arc::new(TransactionIdStore::default()),
                applier.clone(),
            ),
        )?;
        Ok(Self {
            ds,
            applier,
            temp_dir,
        })
    }

    /// Returns the directory holding the log.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Closes the log and opens it again in the same directory.
    pub fn reopen(self) -> Self {
        let Self { ds, temp_dir, .. } = self;
        ds.close().expect("Failed to close file log");
        drop(ds);
        Self::open_in(temp_dir, Config::default()).expect("Failed to reopen file log")
    }
}

impl Default for TestDirLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDirLog {
    type Target = DataSource;

    fn deref(&self) -> &Self::Target {
        &self.ds
    }
}

/// Runs a test with a fresh in-memory log.
///
/// # Example
///
/// ```rust,ignore
/// use txlog_testkit::{node_transaction, with_test_log};
///
/// with_test_log(|log| {
///     let tx_id = log.commit(&node_transaction(1, 1)).unwrap();
///     assert_eq!(tx_id.as_u64(), 1);
/// });
/// ```
pub fn with_test_log<F, R>(f: F) -> R
where
    F: FnOnce(&TestLog) -> R,
{
    let log = TestLog::memory();
    f(&log)
}

/// A command creating node `id`.
#[must_use]
pub fn node_command(id: u64) -> Command {
    Command::Node(NodeCommand {
        id,
        before: None,
        after: Some(NodeRecord {
            dense: false,
            next_rel: -1,
            next_prop: -1,
            labels: 0,
        }),
    })
}

/// A transaction creating `count` nodes starting at `first_id`.
#[must_use]
pub fn node_transaction(first_id: u64, count: usize) -> TransactionRepresentation {
    TransactionRepresentation::new(
        (first_id..).take(count).map(node_command).collect(),
    )
}

/// A transaction creating node `entity_id` and adding it to `index`.
#[must_use]
pub fn legacy_index_transaction(index: &str, entity_id: u64) -> TransactionRepresentation {
    TransactionRepresentation::new(vec![
        node_command(entity_id),
        Command::LegacyIndex(LegacyIndexCommand {
            index_name: index.to_string(),
            entity_type: IndexEntityType::Node,
            action: LegacyIndexAction::Add {
                entity_id,
                key: "name".to_string(),
                value: entity_id.to_be_bytes().to_vec(),
            },
        }),
    ])
}
