//! Reading committed transactions back out of the log.
//!
//! A cursor is positioned at the Start entry of the first transaction it
//! should yield. The position comes from the metadata cache when the cached
//! entry still checks out, or else from the log itself: a binary search over
//! the headers picks the version the transaction committed in, and a scan
//! of that version finds its Start.

use crate::error::{CoreError, CoreResult};
use crate::log::{LogFile, ReadAheadChannel};
use crate::transaction::{
    CommittedTransactionRepresentation, TransactionMetadata, TransactionRepresentation,
};
use crate::types::TransactionId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use txlog_codec::{read_log_entry, Command, LogEntry, LogPosition, PositionAware, StartEntry};

/// Transactions whose Start has been read but not their Commit.
#[derive(Debug, Default)]
struct OpenTransactions(HashMap<i32, (StartEntry, Vec<Command>)>);

impl OpenTransactions {
    fn contains(&self, identifier: i32) -> bool {
        self.0.contains_key(&identifier)
    }

    /// Tracks an entry and returns the transaction it completes, if any.
    fn track(&mut self, entry: LogEntry) -> Option<CommittedTransactionRepresentation> {
        match entry {
            LogEntry::Start(start) => {
                self.0.insert(start.identifier, (start, Vec::new()));
                None
            }
            LogEntry::Command {
                identifier,
                command,
            } => {
                if let Some((_, commands)) = self.0.get_mut(&identifier) {
                    commands.push(command);
                }
                None
            }
            LogEntry::Prepare { .. } => None,
            LogEntry::Done { identifier } => {
                self.0.remove(&identifier);
                None
            }
            LogEntry::OnePhaseCommit(commit) | LogEntry::TwoPhaseCommit(commit) => {
                let (start, commands) = self.0.remove(&commit.identifier)?;
                Some(CommittedTransactionRepresentation {
                    transaction: TransactionRepresentation::from_start(&start, commands),
                    start,
                    commit,
                })
            }
        }
    }
}

/// Scans one version for the transaction that committed as `tx_id`.
fn find_in_version(
    log: &LogFile,
    version: u64,
    tx_id: u64,
) -> CoreResult<Option<CommittedTransactionRepresentation>> {
    let mut reader = log.version_reader(LogPosition::start_of(version))?;
    let mut open = OpenTransactions::default();
    while let Some(versioned) = read_log_entry(&mut reader)? {
        let wanted = versioned
            .entry
            .as_commit()
            .is_some_and(|commit| commit.tx_id == tx_id);
        let completed = open.track(versioned.entry);
        if wanted {
            return Ok(completed);
        }
    }
    Ok(None)
}

/// Opens cursors over the committed transactions in the log.
#[derive(Debug, Clone)]
pub struct LogicalTransactionStore {
    log: Arc<LogFile>,
}

impl LogicalTransactionStore {
    /// Creates a store reading from `log`.
    pub fn new(log: Arc<LogFile>) -> Self {
        Self { log }
    }

    /// Opens a cursor yielding `start` and every transaction after it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchTransaction`] if `start` was pruned or
    /// never written.
    pub fn get_cursor(&self, start: TransactionId) -> CoreResult<TransactionCursor> {
        let position = self.position_of(start)?;
        Ok(TransactionCursor {
            reader: self.log.reader(position)?,
            log: Arc::clone(&self.log),
            start: start.as_u64(),
            next: start.as_u64(),
            open: OpenTransactions::default(),
            failed: false,
        })
    }

    /// Returns the position of the Start entry of `tx_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchTransaction`] if the transaction is not in
    /// the log.
    pub fn position_of(&self, tx_id: TransactionId) -> CoreResult<LogPosition> {
        let id = tx_id.as_u64();
        if id == 0 || id > self.log.last_written_tx_id() {
            return Err(CoreError::NoSuchTransaction { tx_id: id });
        }
        if let Some(position) = self.cached_position(tx_id) {
            return Ok(position);
        }

        let version = self.version_holding(id)?;
        let found = find_in_version(&self.log, version, id)?
            .ok_or(CoreError::NoSuchTransaction { tx_id: id })?;
        let start = &found.start;
        self.log.cache().cache_transaction(
            tx_id,
            TransactionMetadata {
                start_position: start.start_position,
                master_id: start.master_id,
                author_id: start.author_id,
                checksum: start.checksum(),
            },
        );
        Ok(start.start_position)
    }

    /// Returns the cached position if the entry there is still the cached
    /// transaction's Start.
    fn cached_position(&self, tx_id: TransactionId) -> Option<LogPosition> {
        let cached = self.log.cache().transaction(tx_id)?;
        let verified = self
            .log
            .version_reader(cached.start_position)
            .and_then(|mut reader| read_log_entry(&mut reader).map_err(CoreError::from))
            .map(|entry| {
                matches!(entry.map(|e| e.entry), Some(LogEntry::Start(start)) if start.checksum() == cached.checksum)
            });
        if let Ok(true) = verified {
            return Some(cached.start_position);
        }
        debug!(%tx_id, position = %cached.start_position, "stale cached position, scanning");
        self.log.cache().forget_transaction(tx_id);
        None
    }

    /// Returns the newest version whose header precedes `tx_id`.
    fn version_holding(&self, tx_id: u64) -> CoreResult<u64> {
        let versions = self.log.files().versions()?;
        let (mut low, mut high) = (0, versions.len());
        while low < high {
            let mid = low + (high - low) / 2;
            if self.log.prev_committed_tx(versions[mid])? < tx_id {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        match low.checked_sub(1) {
            Some(index) => Ok(versions[index]),
            None => Err(CoreError::NoSuchTransaction { tx_id }),
        }
    }
}

/// Forward-only cursor over committed transactions.
///
/// Yields one transaction per call, in id order, following the log across
/// rotations. Returns `None` at the current end of the log; calling again
/// later picks up transactions appended since. After an error it yields
/// nothing more.
pub struct TransactionCursor {
    reader: ReadAheadChannel,
    log: Arc<LogFile>,
    start: u64,
    next: u64,
    open: OpenTransactions,
    failed: bool,
}

impl TransactionCursor {
    /// Returns the id the next yielded transaction will have.
    #[must_use]
    pub fn next_tx_id(&self) -> TransactionId {
        TransactionId::new(self.next)
    }

    /// Returns the position the cursor reads from next.
    #[must_use]
    pub fn position(&self) -> LogPosition {
        self.reader.current_position()
    }

    fn advance(&mut self) -> CoreResult<Option<CommittedTransactionRepresentation>> {
        loop {
            let before = self.reader.current_position();
            let Some(versioned) = read_log_entry(&mut self.reader)? else {
                // A half-written entry may have been consumed; start over at
                // its beginning next time.
                if self.reader.current_position() != before {
                    self.reader = self.log.reader(before)?;
                }
                return Ok(None);
            };
            let Some(commit) = versioned.entry.as_commit().copied() else {
                self.open.track(versioned.entry);
                continue;
            };

            // Copies made by rotation carry ids the file's header already
            // accounts for.
            let version = self.reader.current_position().log_version();
            if commit.tx_id <= self.log.prev_committed_tx(version)? || commit.tx_id < self.start {
                self.open.track(versioned.entry);
                continue;
            }
            if commit.tx_id != self.next {
                return Err(CoreError::UnexpectedTransactionId {
                    expected: self.next,
                    actual: commit.tx_id,
                });
            }

            let committed = if self.open.contains(commit.identifier) {
                self.open.track(versioned.entry)
            } else {
                // Started before the cursor's position, interleaved with the
                // first transaction it yields.
                find_in_version(&self.log, version, commit.tx_id)?
            };
            let committed =
                committed.ok_or(CoreError::NoSuchTransaction { tx_id: commit.tx_id })?;
            self.next += 1;
            return Ok(Some(committed));
        }
    }
}

impl Iterator for TransactionCursor {
    type Item = CoreResult<CommittedTransactionRepresentation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(committed) => committed.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for TransactionCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCursor")
            .field("position", &self.position())
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log::{LogFiles, LogPruneStrategy};
    use crate::store::{Collaborators, TransactionIdStore};
    use crate::transaction::{
        Forcer, IdOrderingQueue, TransactionAppender, TransactionMetadataCache,
    };
    use crate::types::new_xid;
    use crate::xa::ResourceManager;
    use txlog_codec::NodeCommand;
    use txlog_storage::InMemoryFileSystem;

    struct Setup {
        log: Arc<LogFile>,
        appender: TransactionAppender,
        store: LogicalTransactionStore,
        forcer: Arc<Forcer>,
        ids: Arc<TransactionIdStore>,
    }

    fn setup(config: Config) -> Setup {
        let ids = Arc::new(TransactionIdStore::default());
        let log = Arc::new(
            LogFile::open(
                LogFiles::new(Arc::new(InMemoryFileSystem::new()), "db", "log"),
                config.clone(),
                ids.clone(),
                Arc::new(TransactionMetadataCache::new(100, 100)),
            )
            .unwrap(),
        );
        let forcer = Arc::new(Forcer::new(config.force_mode, Arc::clone(&log)).unwrap());
        let appender = TransactionAppender::new(
            "nioneodb",
            Arc::clone(&log),
            ids.clone(),
            Arc::clone(&forcer),
            Arc::new(IdOrderingQueue::new()),
        );
        Setup {
            store: LogicalTransactionStore::new(Arc::clone(&log)),
            log,
            appender,
            forcer,
            ids,
        }
    }

    fn node(id: u64) -> Command {
        Command::Node(NodeCommand {
            id,
            before: None,
            after: None,
        })
    }

    impl Setup {
        /// Appends and closes a transaction with two node commands.
        fn append(&self, base: u64) -> TransactionId {
            use crate::store::StoreDurability;
            let tx_id = self
                .appender
                .append(&TransactionRepresentation::new(vec![node(base), node(base + 1)]))
                .unwrap();
            self.ids.transaction_closed(tx_id);
            tx_id
        }

        fn ids_from(&self, start: u64) -> Vec<u64> {
            self.store
                .get_cursor(TransactionId::new(start))
                .unwrap()
                .map(|tx| tx.unwrap().tx_id().as_u64())
                .collect()
        }
    }

    #[test]
    fn yields_from_start_in_order() {
        let s = setup(Config::default());
        for i in 0..4 {
            s.append(i * 10);
        }
        assert_eq!(s.ids_from(1), vec![1, 2, 3, 4]);
        assert_eq!(s.ids_from(3), vec![3, 4]);

        let first = s.store.get_cursor(TransactionId::new(1)).unwrap().next().unwrap().unwrap();
        assert_eq!(first.transaction.commands(), &[node(0), node(1)]);
    }

    #[test]
    fn spans_rotation() {
        let s = setup(Config::default());
        for i in 0..3 {
            s.append(i);
        }
        s.log.rotate().unwrap();
        for i in 3..5 {
            s.append(i);
        }
        assert_eq!(s.ids_from(1), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn scans_when_cache_is_cold() {
        let s = setup(Config::default());
        for i in 0..3 {
            s.append(i);
        }
        s.log.rotate().unwrap();
        s.append(3);
        s.log.cache().clear();

        assert_eq!(s.ids_from(2), vec![2, 3, 4]);
        assert!(s.log.cache().transaction(TransactionId::new(2)).is_some());
        assert_eq!(s.ids_from(4), vec![4]);
    }

    #[test]
    fn stale_cache_entry_is_ignored() {
        let s = setup(Config::default());
        s.append(0);
        s.append(1);
        let good = s.log.cache().transaction(TransactionId::new(2)).unwrap();
        s.log.cache().cache_transaction(
            TransactionId::new(2),
            TransactionMetadata {
                checksum: good.checksum ^ 1,
                ..good
            },
        );

        assert_eq!(s.store.position_of(TransactionId::new(2)).unwrap(), good.start_position);
        assert_eq!(s.ids_from(2), vec![2]);
    }

    #[test]
    fn unknown_and_pruned_transactions() {
        let s = setup(Config::default().prune_strategy(LogPruneStrategy::KeepNone));
        s.append(0);
        s.log.rotate().unwrap();
        s.append(1);
        s.log.rotate().unwrap();
        s.log.cache().clear();

        assert!(matches!(
            s.store.get_cursor(TransactionId::new(9)),
            Err(CoreError::NoSuchTransaction { tx_id: 9 })
        ));
        assert!(matches!(
            s.store.get_cursor(TransactionId::new(1)),
            Err(CoreError::NoSuchTransaction { tx_id: 1 })
        ));
        assert_eq!(s.ids_from(2), vec![2]);
    }

    #[test]
    fn cursor_follows_new_appends() {
        let s = setup(Config::default());
        s.append(0);
        let mut cursor = s.store.get_cursor(TransactionId::new(1)).unwrap();
        assert!(cursor.next().is_some());
        assert!(cursor.next().is_none());

        s.append(1);
        assert_eq!(cursor.next().unwrap().unwrap().tx_id(), TransactionId::new(2));
        assert_eq!(cursor.next_tx_id(), TransactionId::new(3));
    }

    #[test]
    fn interleaved_transactions_are_yielded_in_commit_order() {
        let s = setup(Config::default());
        let rm = ResourceManager::new(
            "nioneodb",
            Arc::clone(&s.log),
            Arc::clone(&s.forcer),
            Arc::new(IdOrderingQueue::new()),
            Collaborators {
                generator: s.ids.clone(),
                durability: s.ids.clone(),
                applier: Arc::new(NoopApplier),
            },
        );
        let (early, late) = (new_xid("a"), new_xid("b"));
        rm.start(early.clone(), TransactionRepresentation::new(vec![node(1)])).unwrap();
        rm.start(late.clone(), TransactionRepresentation::new(vec![node(2)])).unwrap();
        rm.prepare(&early).unwrap();
        rm.prepare(&late).unwrap();
        rm.commit(&late, false).unwrap();
        rm.commit(&early, false).unwrap();

        let yielded: Vec<_> = s
            .store
            .get_cursor(TransactionId::new(1))
            .unwrap()
            .map(|tx| tx.unwrap())
            .collect();
        assert_eq!(yielded.len(), 2);
        assert_eq!(yielded[0].start.xid, late);
        assert_eq!(yielded[1].start.xid, early);
        assert_eq!(yielded[1].transaction.commands(), &[node(1)]);
    }

    #[derive(Debug)]
    struct NoopApplier;

    impl crate::store::TransactionApplier for NoopApplier {
        fn apply(
            &self,
            _tx_id: TransactionId,
            _transaction: &TransactionRepresentation,
            _mode: crate::store::ApplyMode,
        ) -> CoreResult<()> {
            Ok(())
        }
    }
}
