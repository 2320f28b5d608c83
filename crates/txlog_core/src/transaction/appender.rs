//! The commit path into the log.

use crate::error::{CoreError, CoreResult};
use crate::log::{LogFile, LogWriter, WriterMark};
use crate::store::TransactionIdGenerator;
use crate::transaction::force::Forcer;
use crate::transaction::metadata_cache::TransactionMetadata;
use crate::transaction::ordering::IdOrderingQueue;
use crate::transaction::representation::{
    CommittedTransactionRepresentation, TransactionRepresentation,
};
use crate::types::{new_xid, TransactionId};
use std::sync::Arc;
use tracing::warn;
use txlog_codec::{LogEntryVersion, StartEntry};

/// Appends transactions to the log.
///
/// The writer lock is held only while entries are written into the buffer
/// and handed to the file. Forcing happens outside it, so throughput is
/// bounded by how well forces batch rather than by disk latency per commit.
#[derive(Debug)]
pub struct TransactionAppender {
    data_source: String,
    log: Arc<LogFile>,
    generator: Arc<dyn TransactionIdGenerator>,
    forcer: Arc<Forcer>,
    legacy_index_order: Arc<IdOrderingQueue>,
}

impl TransactionAppender {
    /// Creates an appender.
    pub fn new(
        data_source: impl Into<String>,
        log: Arc<LogFile>,
        generator: Arc<dyn TransactionIdGenerator>,
        forcer: Arc<Forcer>,
        legacy_index_order: Arc<IdOrderingQueue>,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            log,
            generator,
            forcer,
            legacy_index_order,
        }
    }

    /// Returns the queue legacy index changes are ordered by.
    #[must_use]
    pub fn legacy_index_order(&self) -> &Arc<IdOrderingQueue> {
        &self.legacy_index_order
    }

    /// Appends a locally committed transaction and returns its id.
    ///
    /// When this returns, the transaction is durable. If it changes a legacy
    /// index, its id is also at the head of the ordering queue; the caller
    /// removes it once the index changes are applied.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionAppendFailure`] carrying the assigned
    /// id, or -1 if none was assigned yet. If writing failed, the log is cut
    /// back to where it was and the id goes to the next transaction. If only
    /// the force failed, the entries stay in the log and are not durable.
    pub fn append(&self, transaction: &TransactionRepresentation) -> CoreResult<TransactionId> {
        let legacy = transaction.has_legacy_index_changes();
        let mut assigned = None;

        let ticket = {
            let mut writer = self.log.writer();
            match self.write_transaction(&mut writer, transaction, legacy, &mut assigned) {
                Ok(ticket) => ticket,
                Err(e) => return Err(CoreError::append_failure(assigned, e)),
            }
        };
        let tx_id = assigned.map(TransactionId::new).ok_or_else(|| {
            CoreError::append_failure(None, CoreError::illegal_state("no id assigned"))
        })?;

        if let Err(e) = self.forcer.force(ticket) {
            if legacy {
                // Keep later legacy index transactions from waiting forever.
                if let Err(remove) = self.await_and_remove(tx_id) {
                    warn!(%tx_id, error = %remove, "could not release ordering queue");
                }
            }
            return Err(CoreError::append_failure(Some(tx_id.as_u64()), e));
        }
        self.generator.committed(&self.data_source, -1, tx_id, None);

        if legacy {
            self.legacy_index_order.await_head(tx_id);
        }
        Ok(tx_id)
    }

    fn await_and_remove(&self, tx_id: TransactionId) -> CoreResult<()> {
        self.legacy_index_order.await_head(tx_id);
        self.legacy_index_order.remove_head(tx_id)
    }

    /// Writes the whole transaction with the lock held; returns the force
    /// ticket.
    ///
    /// On failure the log is rolled back to where it stood and the id goes
    /// back to the generator, so the next transaction commits as if this
    /// one had never been tried.
    fn write_transaction(
        &self,
        writer: &mut LogWriter,
        transaction: &TransactionRepresentation,
        legacy: bool,
        assigned: &mut Option<u64>,
    ) -> CoreResult<u64> {
        self.log.rotate_if_needed(writer)?;

        let mark = writer.mark();
        let tx_id = self.generator.generate(transaction)?;
        *assigned = Some(tx_id.as_u64());
        if let Err(e) = self.write_local(writer, transaction, tx_id, legacy) {
            self.undo(writer, mark, tx_id);
            return Err(e);
        }
        Ok(self.forcer.ticket())
    }

    fn write_local(
        &self,
        writer: &mut LogWriter,
        transaction: &TransactionRepresentation,
        tx_id: TransactionId,
        legacy: bool,
    ) -> CoreResult<()> {
        let expected = writer.last_tx_id() + 1;
        if tx_id.as_u64() != expected {
            return Err(CoreError::UnexpectedTransactionId {
                expected,
                actual: tx_id.as_u64(),
            });
        }

        let identifier = writer.next_identifier();
        let start = writer.write_start(identifier, new_xid(&self.data_source), transaction)?;
        self.write_body(writer, &start, transaction, tx_id)?;
        if legacy {
            self.legacy_index_order.offer(tx_id)?;
        }
        self.cache_position(tx_id, &start);
        Ok(())
    }

    /// Writes commands, commit and done after a Start and writes out.
    fn write_body(
        &self,
        writer: &mut LogWriter,
        start: &StartEntry,
        transaction: &TransactionRepresentation,
        tx_id: TransactionId,
    ) -> CoreResult<()> {
        let identifier = start.identifier;
        transaction.accept(|command| {
            writer.write_command(identifier, command)?;
            Ok(true)
        })?;
        writer.write_commit(identifier, tx_id, false)?;
        writer.write_done(identifier)?;
        writer.write_out()
    }

    fn cache_position(&self, tx_id: TransactionId, start: &StartEntry) {
        self.log.cache().cache_transaction(
            tx_id,
            TransactionMetadata {
                start_position: start.start_position,
                master_id: start.master_id,
                author_id: start.author_id,
                checksum: start.checksum(),
            },
        );
    }

    /// Takes back a transaction that failed before its writes were handed
    /// to the file.
    fn undo(&self, writer: &mut LogWriter, mark: WriterMark, tx_id: TransactionId) {
        if let Err(e) = writer.roll_back(mark) {
            warn!(%tx_id, error = %e, "could not roll back failed append");
        }
        self.generator.released(tx_id);
    }

    /// Appends a transaction committed elsewhere, keeping its id.
    ///
    /// Returns `false` without writing anything if the transaction is
    /// already in the log, which makes catch-up safe to retry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfOrderApply`] if earlier transactions are
    /// missing, or [`CoreError::TransactionAppendFailure`] if writing fails.
    pub fn append_committed(
        &self,
        committed: &CommittedTransactionRepresentation,
    ) -> CoreResult<bool> {
        let tx_id = committed.tx_id();
        let ticket = {
            let mut writer = self.log.writer();
            let last = writer.last_tx_id();
            if tx_id.as_u64() <= last {
                return Ok(false);
            }
            if tx_id.as_u64() != last + 1 {
                warn!(expected = last + 1, actual = %tx_id, "rejecting out of order transaction");
                return Err(CoreError::OutOfOrderApply {
                    expected: last + 1,
                    actual: tx_id.as_u64(),
                });
            }
            self.write_committed(&mut writer, committed)
                .map_err(|e| CoreError::append_failure(Some(tx_id.as_u64()), e))?
        };

        self.forcer
            .force(ticket)
            .map_err(|e| CoreError::append_failure(Some(tx_id.as_u64()), e))?;
        self.generator.committed(
            &self.data_source,
            committed.start.identifier,
            tx_id,
            Some(committed.start.author_id),
        );
        Ok(true)
    }

    fn write_committed(
        &self,
        writer: &mut LogWriter,
        committed: &CommittedTransactionRepresentation,
    ) -> CoreResult<u64> {
        self.log.rotate_if_needed(writer)?;

        let mark = writer.mark();
        let identifier = writer.next_identifier();
        let mut start = committed.start.clone();
        start.identifier = identifier;
        let written = writer
            .write_start_entry(start, LogEntryVersion::CURRENT)
            .and_then(|start| {
                self.write_body(writer, &start, &committed.transaction, committed.tx_id())?;
                Ok(start)
            });
        match written {
            Ok(start) => {
                self.cache_position(committed.tx_id(), &start);
                Ok(self.forcer.ticket())
            }
            Err(e) => {
                if let Err(undo) = writer.roll_back(mark) {
                    warn!(tx_id = %committed.tx_id(), error = %undo, "could not roll back failed apply");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ForceMode};
    use crate::extract::LogicalTransactionStore;
    use crate::log::LogFiles;
    use crate::store::{StoreDurability, TransactionIdStore};
    use crate::transaction::TransactionMetadataCache;
    use std::thread;
    use std::time::Duration;
    use txlog_codec::{
        Command, IndexEntityType, LegacyIndexAction, LegacyIndexCommand, LogPosition, NodeCommand,
    };
    use txlog_storage::InMemoryFileSystem;

    struct Setup {
        appender: Arc<TransactionAppender>,
        log: Arc<LogFile>,
        store: Arc<TransactionIdStore>,
    }

    fn setup(config: Config) -> Setup {
        let fs = InMemoryFileSystem::new();
        let store = Arc::new(TransactionIdStore::default());
        let log = Arc::new(
            LogFile::open(
                LogFiles::new(Arc::new(fs), "db", "log"),
                config.clone(),
                store.clone(),
                Arc::new(TransactionMetadataCache::new(100, 100)),
            )
            .unwrap(),
        );
        let forcer = Arc::new(Forcer::new(config.force_mode, Arc::clone(&log)).unwrap());
        let appender = Arc::new(TransactionAppender::new(
            "nioneodb",
            Arc::clone(&log),
            store.clone(),
            forcer,
            Arc::new(IdOrderingQueue::new()),
        ));
        Setup {
            appender,
            log,
            store,
        }
    }

    fn tx(nodes: &[u64]) -> TransactionRepresentation {
        TransactionRepresentation::new(
            nodes
                .iter()
                .map(|&id| {
                    Command::Node(NodeCommand {
                        id,
                        before: None,
                        after: None,
                    })
                })
                .collect(),
        )
    }

    fn logged_commits(log: &LogFile) -> Vec<u64> {
        let mut ids = Vec::new();
        log.accept(LogPosition::start_of(0), |_, e| {
            if let Some(commit) = e.entry.as_commit() {
                ids.push(commit.tx_id);
            }
            Ok(true)
        })
        .unwrap();
        ids
    }

    #[test]
    fn ids_are_consecutive() {
        let s = setup(Config::default());
        for expected in 1..=3 {
            assert_eq!(s.appender.append(&tx(&[1, 2])).unwrap(), TransactionId::new(expected));
        }
        assert_eq!(logged_commits(&s.log), vec![1, 2, 3]);
        assert!(s.log.cache().transaction(TransactionId::new(2)).is_some());
    }

    #[test]
    fn entries_are_start_commands_commit_done() {
        let s = setup(Config::default());
        s.appender.append(&tx(&[7, 8])).unwrap();

        let mut kinds = Vec::new();
        s.log
            .accept(LogPosition::start_of(0), |_, e| {
                kinds.push(e.entry.type_byte());
                Ok(true)
            })
            .unwrap();
        assert_eq!(kinds, vec![1, 3, 3, 5, 4]);
    }

    #[test]
    fn concurrent_appends_have_no_gaps() {
        let s = setup(Config::default().force_mode(ForceMode::Batched {
            max_wait: std::time::Duration::from_millis(1),
        }));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let appender = Arc::clone(&s.appender);
                thread::spawn(move || {
                    (0..25)
                        .map(|i| appender.append(&tx(&[t * 100 + i])).unwrap().as_u64())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());
        assert_eq!(logged_commits(&s.log), (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn legacy_index_transaction_waits_for_head() {
        let s = setup(Config::default());
        let legacy = TransactionRepresentation::new(vec![Command::LegacyIndex(LegacyIndexCommand {
            index_name: "users".into(),
            entity_type: IndexEntityType::Node,
            action: LegacyIndexAction::Delete,
        })]);
        let tx_id = s.appender.append(&legacy).unwrap();
        let order = s.appender.legacy_index_order();
        assert_eq!(order.len(), 1);
        order.remove_head(tx_id).unwrap();
        assert!(order.is_empty());
    }

    #[test]
    fn failed_append_leaves_log_as_it_was() {
        let s = setup(Config::default().rotation_quiesce_timeout(Some(Duration::from_millis(200))));
        let first = s.appender.append(&tx(&[1])).unwrap();
        s.store.transaction_closed(first);
        let before = s.log.written_position();

        // Id 100 already queued makes offering id 2 fail after the write.
        let order = s.appender.legacy_index_order();
        order.offer(TransactionId::new(100)).unwrap();
        let legacy = TransactionRepresentation::new(vec![Command::LegacyIndex(LegacyIndexCommand {
            index_name: "users".into(),
            entity_type: IndexEntityType::Node,
            action: LegacyIndexAction::Delete,
        })]);
        let err = s.appender.append(&legacy).unwrap_err();
        assert!(matches!(err, CoreError::TransactionAppendFailure { tx_id: 2, .. }));
        assert_eq!(s.log.written_position(), before);
        assert_eq!(s.log.writer().in_flight_count(), 0);
        assert!(s.log.cache().transaction(TransactionId::new(2)).is_none());
        order.remove_head(TransactionId::new(100)).unwrap();

        let second = s.appender.append(&tx(&[2, 3])).unwrap();
        assert_eq!(second, TransactionId::new(2));
        s.store.transaction_closed(second);
        assert_eq!(logged_commits(&s.log), vec![1, 2]);

        s.log.rotate().unwrap();
        assert_eq!(s.appender.append(&tx(&[4])).unwrap(), TransactionId::new(3));
    }

    #[test]
    fn committed_append_is_idempotent() {
        let source = setup(Config::default());
        source.appender.append(&tx(&[1])).unwrap();
        let shipped = LogicalTransactionStore::new(Arc::clone(&source.log))
            .get_cursor(TransactionId::new(1))
            .unwrap()
            .next()
            .unwrap()
            .unwrap();

        let target = setup(Config::default());
        assert!(target.appender.append_committed(&shipped).unwrap());
        assert!(!target.appender.append_committed(&shipped).unwrap());
        assert_eq!(logged_commits(&target.log), vec![1]);
    }

    #[test]
    fn committed_append_rejects_gaps() {
        let s = setup(Config::default());
        let start = StartEntry {
            identifier: 1,
            xid: new_xid("other"),
            master_id: 2,
            author_id: 2,
            start_position: LogPosition::start_of(0),
            time_written: 0,
            last_committed_tx_when_started: 0,
            additional_header: Vec::new(),
        };
        let committed = CommittedTransactionRepresentation {
            transaction: TransactionRepresentation::from_start(&start, Vec::new()),
            start,
            commit: txlog_codec::CommitEntry {
                identifier: 1,
                tx_id: 3,
                time_written: 0,
            },
        };
        let err = s.appender.append_committed(&committed).unwrap_err();
        assert!(matches!(err, CoreError::OutOfOrderApply { expected: 1, actual: 3 }));
    }
}
