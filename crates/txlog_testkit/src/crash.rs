//! Crash recovery testing for txlog.
//!
//! This module simulates crashes at various points while transactions are
//! written and verifies what recovery makes of the surviving files.
//!
//! ## Test Strategy
//!
//! 1. **Crash after commit** - Committed transactions survive
//! 2. **Crash mid-append** - The torn entry is cut off, nothing else is lost
//! 3. **Crash before commit** - The started transaction is rolled back
//! 4. **Crash after prepare** - The transaction is kept in doubt
//! 5. **Crash during rotation** - The half-written version is removed
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txlog_testkit::crash::{CrashPoint, CrashRecoveryHarness};
//!
//! let result = CrashRecoveryHarness::new(10).run(CrashPoint::MidAppend)?;
//! assert_eq!(result.replayable.len(), 10);
//! ```

use crate::fixtures::{node_transaction, RecordingApplier, TestLog, TEST_DIR, TEST_LOG_NAME};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use txlog_core::{
    new_xid, Collaborators, Config, CoreResult, DataSource, RecoveryReport, TransactionIdStore,
};
use txlog_storage::{FileSystem, InMemoryFileSystem, StorageBackend, StorageError, StorageResult};

/// What a crash leaves of the files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashKind {
    /// The machine lost power: only synced bytes survive.
    PowerLoss,
    /// The process died: every appended byte survives.
    ProcessKill,
}

impl CrashKind {
    /// Returns an independent copy of what survives this crash of `fs`.
    #[must_use]
    pub fn survivors(self, fs: &InMemoryFileSystem) -> InMemoryFileSystem {
        match self {
            Self::PowerLoss => fs.crash(),
            Self::ProcessKill => fs.snapshot(),
        }
    }
}

const UNLIMITED: u64 = u64::MAX;

/// An in-memory file system whose appends can be made to fail.
///
/// Once the byte budget set by [`FaultyFileSystem::fail_after`] runs out,
/// the append that crosses it writes the part that fits and fails, and
/// every later append fails outright.
#[derive(Debug, Clone)]
pub struct FaultyFileSystem {
    inner: InMemoryFileSystem,
    budget: Arc<AtomicU64>,
}

impl FaultyFileSystem {
    /// Wraps `inner` with an unlimited budget.
    #[must_use]
    pub fn new(inner: InMemoryFileSystem) -> Self {
        Self {
            inner,
            budget: Arc::new(AtomicU64::new(UNLIMITED)),
        }
    }

    /// Returns the wrapped file system.
    #[must_use]
    pub fn inner(&self) -> &InMemoryFileSystem {
        &self.inner
    }

    /// Lets `bytes` more bytes be appended before appends start failing.
    pub fn fail_after(&self, bytes: u64) {
        self.budget.store(bytes, Ordering::SeqCst);
    }

    /// Lifts the budget.
    pub fn heal(&self) {
        self.budget.store(UNLIMITED, Ordering::SeqCst);
    }

    fn wrap(&self, inner: Box<dyn StorageBackend>) -> Box<dyn StorageBackend> {
        Box::new(FaultyBackend {
            inner,
            budget: Arc::clone(&self.budget),
        })
    }
}

impl FileSystem for FaultyFileSystem {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(self.wrap(self.inner.open(path)?))
    }

    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(self.wrap(self.inner.create(path)?))
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn delete(&self, path: &Path) -> StorageResult<()> {
        self.inner.delete(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.inner.rename(from, to)
    }

    fn list(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        self.inner.list(dir)
    }

    fn file_size(&self, path: &Path) -> StorageResult<u64> {
        self.inner.file_size(path)
    }

    fn create_dir_all(&self, dir: &Path) -> StorageResult<()> {
        self.inner.create_dir_all(dir)
    }
}

struct FaultyBackend {
    inner: Box<dyn StorageBackend>,
    budget: Arc<AtomicU64>,
}

impl FaultyBackend {
    fn simulated_crash() -> StorageError {
        StorageError::Io(std::io::Error::other("simulated crash during append"))
    }
}

impl StorageBackend for FaultyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.inner.read_into(offset, buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let budget = self.budget.load(Ordering::SeqCst);
        if budget == UNLIMITED {
            return self.inner.append(data);
        }
        let len = data.len() as u64;
        if len <= budget {
            self.budget.store(budget - len, Ordering::SeqCst);
            return self.inner.append(data);
        }
        self.budget.store(0, Ordering::SeqCst);
        if budget > 0 {
            let _ = self.inner.append(&data[..budget as usize]);
        }
        Err(Self::simulated_crash())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Power loss right after the last commit returned.
    AfterCommit,
    /// Process killed while the next transaction was being written.
    MidAppend,
    /// Power loss after a Start and its commands were forced, before the
    /// commit.
    StartWithoutCommit,
    /// Power loss after a coordinated transaction was prepared.
    AfterPrepare,
    /// Power loss while rotation was preparing the next version.
    DuringRotation,
}

/// What recovery made of a crash.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Where the crash happened.
    pub point: CrashPoint,
    /// Transactions committed before the crash.
    pub committed_before: u64,
    /// What recovery reported on the first reopen.
    pub report: RecoveryReport,
    /// Transaction ids a cursor reads back after recovery.
    pub replayable: Vec<u64>,
    /// Transactions left in doubt.
    pub in_doubt: usize,
    /// Whether recovering the recovered log again changed nothing.
    pub stable_on_rerun: bool,
}

/// Test harness for crash recovery scenarios.
#[derive(Debug, Clone)]
pub struct CrashRecoveryHarness {
    committed: u64,
    config: Config,
}

impl CrashRecoveryHarness {
    /// Creates a harness that commits `committed` transactions before each
    /// crash.
    #[must_use]
    pub fn new(committed: u64) -> Self {
        Self {
            committed,
            config: Config::default(),
        }
    }

    /// Uses `config` for every log the harness opens.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Commits, crashes at `point`, recovers and reopens once more.
    ///
    /// # Errors
    ///
    /// Returns an error if a step that should succeed fails.
    pub fn run(&self, point: CrashPoint) -> CoreResult<CrashRecoveryResult> {
        let fs = FaultyFileSystem::new(InMemoryFileSystem::new());
        let ds = DataSource::open(
            Arc::new(fs.clone()),
            TEST_DIR,
            TEST_LOG_NAME,
            self.config.clone(),
            Collaborators::with_id_store(
                Arc::new(TransactionIdStore::default()),
                Arc::new(RecordingApplier::new()),
            ),
        )?;
        for i in 1..=self.committed {
            ds.commit(&node_transaction(i, 2))?;
        }

        let next = node_transaction(self.committed + 1, 2);
        let kind = match point {
            CrashPoint::AfterCommit => CrashKind::PowerLoss,
            CrashPoint::MidAppend => {
                // Killed while handing entries to the file, before anything
                // could take them back.
                let mut writer = ds.log().writer();
                let identifier = writer.next_identifier();
                writer.write_start(identifier, new_xid(TEST_LOG_NAME), &next)?;
                for command in next.commands() {
                    writer.write_command(identifier, command)?;
                }
                fs.fail_after(5);
                if writer.write_out().is_ok() {
                    return Err(txlog_core::CoreError::illegal_state(
                        "append survived the simulated crash",
                    ));
                }
                CrashKind::ProcessKill
            }
            CrashPoint::StartWithoutCommit => {
                let mut writer = ds.log().writer();
                let identifier = writer.next_identifier();
                writer.write_start(identifier, new_xid(TEST_LOG_NAME), &next)?;
                for command in next.commands() {
                    writer.write_command(identifier, command)?;
                }
                writer.force()?;
                CrashKind::PowerLoss
            }
            CrashPoint::AfterPrepare => {
                let xid = new_xid(TEST_LOG_NAME);
                ds.resource_manager().start(xid.clone(), next)?;
                ds.resource_manager().prepare(&xid)?;
                CrashKind::PowerLoss
            }
            CrashPoint::DuringRotation => {
                let tmp = ds
                    .files()
                    .dir()
                    .join(format!("{TEST_LOG_NAME}.v{}.tmp", ds.log().current_version() + 1));
                fs.inner().put_file(&tmp, vec![0xAB; 64]);
                CrashKind::PowerLoss
            }
        };
        info!(?point, ?kind, committed = self.committed, "simulating crash");
        let survivors = kind.survivors(fs.inner());
        drop(ds);

        let recovered = TestLog::open_on(survivors, self.config.clone())?;
        let report = recovered.recovery_report().cloned().unwrap_or_default();
        let replayable = recovered.committed_tx_ids();
        let in_doubt = recovered.resource_manager().recover().len();

        let rerun = recovered.reopen_after(CrashKind::PowerLoss);
        let stable_on_rerun = rerun.committed_tx_ids() == replayable
            && rerun.recovery_report().is_some_and(|r| {
                r.truncated_bytes == 0
                    && r.resolution.rolled_back == 0
                    && r.resolution.recommitted.is_empty()
                    && r.resolution.in_doubt.len() == in_doubt
            });

        Ok(CrashRecoveryResult {
            point,
            committed_before: self.committed,
            report,
            replayable,
            in_doubt,
            stable_on_rerun,
        })
    }
}
