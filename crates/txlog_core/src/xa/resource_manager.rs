//! Coordinated transactions and their lifecycle in the log.
//!
//! A transaction known by its xid moves through
//!
//! ```text
//! Active -> (Prepared) -> CommitStarted -> forgotten
//! ```
//!
//! and can be marked rollback-only until its commit starts. The Start entry
//! is written lazily, at prepare or commit, so a transaction that rolls back
//! early leaves nothing in the log. The durable id is generated when the
//! Commit entry is written: ids follow commit order, not start order.
//!
//! Prepare, commit, rollback and the other status changes are serialized by
//! one lock, held until the decision is in the log. Forcing, applying and
//! the Done entry happen after it is released.

use crate::error::{CoreError, CoreResult};
use crate::log::{LogFile, LogWriter, WriterMark};
use crate::store::{ApplyMode, Collaborators};
use crate::transaction::{
    Forcer, IdOrderingQueue, TransactionMetadata, TransactionRepresentation,
};
use crate::types::TransactionId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use txlog_codec::{Command, LogEntry, LogPosition, StartEntry, Xid};

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Started, commands may still be added.
    Active,
    /// Prepare is durable in the log.
    Prepared,
    /// The Commit entry is written; only Done remains.
    CommitStarted,
}

/// Result of preparing a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Nothing to write; the transaction is already finished.
    ReadOnly,
    /// Prepared, waiting for the coordinator's decision.
    Prepared,
}

#[derive(Debug)]
struct XidStatus {
    identifier: i32,
    state: TransactionState,
    rollback_only: bool,
    /// Commit order for committed transactions, start order otherwise.
    sequence: u64,
    transaction: TransactionRepresentation,
    start: Option<StartEntry>,
    tx_id: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct Registry {
    by_xid: HashMap<Xid, XidStatus>,
    by_identifier: HashMap<i32, Xid>,
    next_sequence: u64,
}

impl Registry {
    fn sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn get(&self, xid: &Xid) -> CoreResult<&XidStatus> {
        self.by_xid
            .get(xid)
            .ok_or_else(|| CoreError::UnknownXid { xid: xid.clone() })
    }

    fn get_mut(&mut self, xid: &Xid) -> CoreResult<&mut XidStatus> {
        self.by_xid
            .get_mut(xid)
            .ok_or_else(|| CoreError::UnknownXid { xid: xid.clone() })
    }

    fn insert(&mut self, xid: Xid, status: XidStatus) {
        self.by_identifier.insert(status.identifier, xid.clone());
        self.by_xid.insert(xid, status);
    }

    fn remove(&mut self, xid: &Xid) -> Option<XidStatus> {
        let status = self.by_xid.remove(xid)?;
        self.by_identifier.remove(&status.identifier);
        Some(status)
    }

    fn by_identifier_mut(&mut self, identifier: i32) -> CoreResult<&mut XidStatus> {
        self.by_identifier
            .get(&identifier)
            .and_then(|xid| self.by_xid.get_mut(xid))
            .ok_or_else(|| {
                CoreError::illegal_state(format!("entry for unknown identifier {identifier}"))
            })
    }
}

/// What resolving recovered transactions did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Transactions committed again, in the order they originally committed.
    pub recommitted: Vec<TransactionId>,
    /// Transactions rolled back because they never prepared.
    pub rolled_back: usize,
    /// Prepared transactions left for the coordinator to decide.
    pub in_doubt: Vec<Xid>,
}

/// Tracks coordinated transactions by xid and writes their lifecycle to the
/// log.
#[derive(Debug)]
pub struct ResourceManager {
    data_source: String,
    log: Arc<LogFile>,
    forcer: Arc<Forcer>,
    legacy_index_order: Arc<IdOrderingQueue>,
    collaborators: Collaborators,
    registry: RwLock<Registry>,
    commit_lock: Mutex<()>,
}

impl ResourceManager {
    /// Creates a resource manager writing to `log`.
    pub fn new(
        data_source: impl Into<String>,
        log: Arc<LogFile>,
        forcer: Arc<Forcer>,
        legacy_index_order: Arc<IdOrderingQueue>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            log,
            forcer,
            legacy_index_order,
            collaborators,
            registry: RwLock::new(Registry::default()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Starts a transaction under `xid` and returns its log identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `xid` is already known.
    pub fn start(&self, xid: Xid, transaction: TransactionRepresentation) -> CoreResult<i32> {
        let _decide = self.commit_lock.lock();
        if self.registry.read().by_xid.contains_key(&xid) {
            return Err(CoreError::invalid_operation(format!("{xid:?} already started")));
        }
        let identifier = self.log.writer().next_identifier();
        let mut registry = self.registry.write();
        let sequence = registry.sequence();
        registry.insert(
            xid,
            XidStatus {
                identifier,
                state: TransactionState::Active,
                rollback_only: false,
                sequence,
                transaction,
                start: None,
                tx_id: None,
            },
        );
        Ok(identifier)
    }

    /// Adds a command to an active transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownXid`], or [`CoreError::InvalidOperation`]
    /// once the transaction is prepared or marked rollback-only.
    pub fn add_command(&self, xid: &Xid, command: Command) -> CoreResult<()> {
        let _decide = self.commit_lock.lock();
        let mut registry = self.registry.write();
        let status = registry.get_mut(xid)?;
        if status.state != TransactionState::Active || status.rollback_only {
            return Err(CoreError::invalid_operation(format!(
                "cannot add commands to {xid:?} in state {:?}",
                status.state
            )));
        }
        status.transaction.push(command);
        Ok(())
    }

    /// Marks a transaction so that it can only roll back.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] once the commit has started.
    pub fn set_rollback_only(&self, xid: &Xid) -> CoreResult<()> {
        let _decide = self.commit_lock.lock();
        let mut registry = self.registry.write();
        let status = registry.get_mut(xid)?;
        if status.state == TransactionState::CommitStarted {
            return Err(CoreError::invalid_operation(format!(
                "{xid:?} is already committing"
            )));
        }
        status.rollback_only = true;
        Ok(())
    }

    /// Returns the state of a transaction, or `None` if it is unknown or
    /// finished.
    #[must_use]
    pub fn state(&self, xid: &Xid) -> Option<TransactionState> {
        self.registry.read().by_xid.get(xid).map(|s| s.state)
    }

    /// Returns whether a transaction is marked rollback-only.
    #[must_use]
    pub fn is_rollback_only(&self, xid: &Xid) -> bool {
        self.registry
            .read()
            .by_xid
            .get(xid)
            .is_some_and(|s| s.rollback_only)
    }

    /// Returns how many transactions are known.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.read().by_xid.len()
    }

    /// Returns whether no transactions are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the prepared transactions waiting for a decision, oldest
    /// first.
    #[must_use]
    pub fn recover(&self) -> Vec<Xid> {
        let registry = self.registry.read();
        let mut prepared: Vec<(u64, Xid)> = registry
            .by_xid
            .iter()
            .filter(|(_, s)| s.state == TransactionState::Prepared)
            .map(|(xid, s)| (s.sequence, xid.clone()))
            .collect();
        prepared.sort_by_key(|(sequence, _)| *sequence);
        prepared.into_iter().map(|(_, xid)| xid).collect()
    }

    /// Makes a transaction's Start, commands and Prepare durable.
    ///
    /// A transaction without commands is read-only: it is finished right
    /// away and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the transaction is not
    /// active or is marked rollback-only, or the write error. A transaction
    /// whose prepare could not be written is rolled back.
    pub fn prepare(&self, xid: &Xid) -> CoreResult<PrepareOutcome> {
        let ticket = {
            let _decide = self.commit_lock.lock();
            let mut writer = self.log.writer();
            let mut registry = self.registry.write();
            let status = registry.get(xid)?;
            if status.state != TransactionState::Active || status.rollback_only {
                return Err(CoreError::invalid_operation(format!(
                    "cannot prepare {xid:?} in state {:?}",
                    status.state
                )));
            }
            if status.transaction.is_empty() {
                registry.remove(xid);
                debug!(?xid, "read-only transaction finished at prepare");
                return Ok(PrepareOutcome::ReadOnly);
            }

            let identifier = status.identifier;
            self.log.rotate_if_needed(&mut writer)?;
            let mark = writer.mark();
            match self.write_prepare(&mut writer, &mut registry, xid) {
                Ok(ticket) => ticket,
                Err(e) => {
                    self.undo(&mut writer, mark, identifier, None);
                    registry.remove(xid);
                    return Err(e);
                }
            }
        };

        self.forcer.force(ticket)?;
        Ok(PrepareOutcome::Prepared)
    }

    fn write_prepare(
        &self,
        writer: &mut LogWriter,
        registry: &mut Registry,
        xid: &Xid,
    ) -> CoreResult<u64> {
        let status = registry.get_mut(xid)?;
        self.write_start_once(writer, xid, status)?;
        writer.write_prepare(status.identifier)?;
        writer.write_out()?;
        status.state = TransactionState::Prepared;
        Ok(self.forcer.ticket())
    }

    /// Writes the Start entry and commands unless they are already in the
    /// log.
    fn write_start_once(
        &self,
        writer: &mut LogWriter,
        xid: &Xid,
        status: &mut XidStatus,
    ) -> CoreResult<()> {
        if status.start.is_some() {
            return Ok(());
        }
        let start = writer.write_start(status.identifier, xid.clone(), &status.transaction)?;
        status.transaction.accept(|command| {
            writer.write_command(status.identifier, command)?;
            Ok(true)
        })?;
        status.start = Some(start);
        Ok(())
    }

    /// Commits a transaction and applies it to the store.
    ///
    /// With `one_phase` an active transaction is prepared implicitly, without
    /// a Prepare entry. Otherwise it must be prepared. Returns `None` for a
    /// read-only transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for an illegal transition,
    /// [`CoreError::TransactionAppendFailure`] if the log write fails, or the
    /// applier's error. After an apply error the commit is durable and
    /// recovery completes it.
    pub fn commit(&self, xid: &Xid, one_phase: bool) -> CoreResult<Option<TransactionId>> {
        let (tx_id, ticket, transaction, identifier) = {
            let _decide = self.commit_lock.lock();
            let mut writer = self.log.writer();
            let mut registry = self.registry.write();
            let status = registry.get(xid)?;
            if status.rollback_only {
                return Err(CoreError::invalid_operation(format!(
                    "{xid:?} is marked rollback-only"
                )));
            }
            match (status.state, one_phase) {
                (TransactionState::CommitStarted, _) => {
                    return Err(CoreError::invalid_operation(format!(
                        "{xid:?} is already committing"
                    )));
                }
                (TransactionState::Active, false) => {
                    return Err(CoreError::invalid_operation(format!(
                        "two-phase commit of unprepared {xid:?}"
                    )));
                }
                (TransactionState::Active, true) if status.transaction.is_empty() => {
                    registry.remove(xid);
                    return Ok(None);
                }
                _ => {}
            }

            let identifier = status.identifier;
            self.log.rotate_if_needed(&mut writer)?;
            let mark = writer.mark();
            let mut assigned = None;
            match self.write_commit(&mut writer, &mut registry, xid, &mut assigned) {
                Ok((ticket, transaction)) => {
                    let tx_id = assigned.map(TransactionId::new).ok_or_else(|| {
                        CoreError::illegal_state("commit written without an id")
                    })?;
                    (tx_id, ticket, transaction, identifier)
                }
                Err(e) => {
                    self.undo(&mut writer, mark, identifier, assigned.map(TransactionId::new));
                    registry.remove(xid);
                    return Err(CoreError::append_failure(assigned, e));
                }
            }
        };

        let legacy = transaction.has_legacy_index_changes();
        if let Err(e) = self.forcer.force(ticket) {
            if legacy {
                self.legacy_index_order.await_head(tx_id);
                if let Err(remove) = self.legacy_index_order.remove_head(tx_id) {
                    warn!(%tx_id, error = %remove, "could not release ordering queue");
                }
            }
            return Err(CoreError::append_failure(Some(tx_id.as_u64()), e));
        }
        self.collaborators
            .generator
            .committed(&self.data_source, identifier, tx_id, None);
        if legacy {
            self.legacy_index_order.await_head(tx_id);
        }

        let applied = self
            .collaborators
            .applier
            .apply(tx_id, &transaction, ApplyMode::Internal);
        if legacy {
            if let Err(e) = self.legacy_index_order.remove_head(tx_id) {
                warn!(%tx_id, error = %e, "legacy index ordering out of step");
            }
        }
        applied?;
        self.collaborators.durability.transaction_closed(tx_id);

        self.finish(xid, identifier)?;
        debug!(?xid, %tx_id, one_phase, "committed");
        Ok(Some(tx_id))
    }

    /// Writes the Commit entry; returns the force ticket and the transaction
    /// to apply.
    fn write_commit(
        &self,
        writer: &mut LogWriter,
        registry: &mut Registry,
        xid: &Xid,
        assigned: &mut Option<u64>,
    ) -> CoreResult<(u64, TransactionRepresentation)> {
        let sequence = registry.sequence();
        let status = registry.get_mut(xid)?;

        let tx_id = self.collaborators.generator.generate(&status.transaction)?;
        *assigned = Some(tx_id.as_u64());
        let expected = writer.last_tx_id() + 1;
        if tx_id.as_u64() != expected {
            return Err(CoreError::UnexpectedTransactionId {
                expected,
                actual: tx_id.as_u64(),
            });
        }

        self.write_start_once(writer, xid, status)?;
        let two_phase = status.state == TransactionState::Prepared;
        writer.write_commit(status.identifier, tx_id, two_phase)?;
        writer.write_out()?;
        if status.transaction.has_legacy_index_changes() {
            self.legacy_index_order.offer(tx_id)?;
        }

        if let Some(start) = &status.start {
            let start_position = writer
                .start_position(status.identifier)
                .unwrap_or(start.start_position);
            self.log.cache().cache_transaction(
                tx_id,
                TransactionMetadata {
                    start_position,
                    master_id: start.master_id,
                    author_id: start.author_id,
                    checksum: start.checksum(),
                },
            );
        }

        status.state = TransactionState::CommitStarted;
        status.tx_id = Some(tx_id);
        status.sequence = sequence;
        Ok((self.forcer.ticket(), status.transaction.clone()))
    }

    /// Takes the log back to `mark` after a failed prepare or commit, then
    /// ends the transaction if its Start was in the log already.
    fn undo(
        &self,
        writer: &mut LogWriter,
        mark: WriterMark,
        identifier: i32,
        tx_id: Option<TransactionId>,
    ) {
        if let Err(e) = writer.roll_back(mark) {
            warn!(identifier, error = %e, "could not roll back failed write");
        }
        writer.abandon(identifier);
        if let Some(tx_id) = tx_id {
            self.collaborators.generator.released(tx_id);
        }
    }

    /// Writes Done and forgets the transaction.
    fn finish(&self, xid: &Xid, identifier: i32) -> CoreResult<()> {
        let mut writer = self.log.writer();
        writer.write_done(identifier)?;
        writer.write_out()?;
        self.registry.write().remove(xid);
        Ok(())
    }

    /// Rolls a transaction back.
    ///
    /// Writes Done if the Start entry is in the log; no Commit entry ever
    /// appears for the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] once the commit has started,
    /// or the write error.
    pub fn rollback(&self, xid: &Xid) -> CoreResult<()> {
        let _decide = self.commit_lock.lock();
        let mut writer = self.log.writer();
        let mut registry = self.registry.write();
        let status = registry.get(xid)?;
        if status.state == TransactionState::CommitStarted {
            return Err(CoreError::invalid_operation(format!(
                "cannot roll back {xid:?}, commit has started"
            )));
        }
        let identifier = status.identifier;
        if writer.is_in_flight(identifier) {
            writer.write_done(identifier)?;
            writer.write_out()?;
        }
        registry.remove(xid);
        debug!(?xid, "rolled back");
        Ok(())
    }

    /// Feeds one entry found by recovery into the registry.
    pub(crate) fn inject(&self, position: LogPosition, entry: LogEntry) -> CoreResult<()> {
        let mut registry = self.registry.write();
        match entry {
            LogEntry::Start(mut start) => {
                start.start_position = position;
                if registry.by_identifier.contains_key(&start.identifier) {
                    return Err(CoreError::illegal_state(format!(
                        "identifier {} started twice",
                        start.identifier
                    )));
                }
                if registry.by_xid.contains_key(&start.xid) {
                    return Err(CoreError::illegal_state(format!(
                        "{:?} started twice",
                        start.xid
                    )));
                }
                let sequence = registry.sequence();
                let xid = start.xid.clone();
                registry.insert(
                    xid,
                    XidStatus {
                        identifier: start.identifier,
                        state: TransactionState::Active,
                        rollback_only: false,
                        sequence,
                        transaction: TransactionRepresentation::from_start(&start, Vec::new()),
                        start: Some(start),
                        tx_id: None,
                    },
                );
            }
            LogEntry::Command {
                identifier,
                command,
            } => registry.by_identifier_mut(identifier)?.transaction.push(command),
            LogEntry::Prepare { identifier, .. } => {
                registry.by_identifier_mut(identifier)?.state = TransactionState::Prepared;
            }
            LogEntry::OnePhaseCommit(commit) | LogEntry::TwoPhaseCommit(commit) => {
                let sequence = registry.sequence();
                let status = registry.by_identifier_mut(commit.identifier)?;
                let tx_id = TransactionId::new(commit.tx_id);
                status.state = TransactionState::CommitStarted;
                status.tx_id = Some(tx_id);
                status.sequence = sequence;
                if let Some(start) = &status.start {
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
            }
            LogEntry::Done { identifier } => {
                if let Some(xid) = registry.by_identifier.get(&identifier).cloned() {
                    registry.remove(&xid);
                } else {
                    debug!(identifier, "done for a transaction started before the scan");
                }
            }
        }
        Ok(())
    }

    /// Resolves everything recovery injected.
    ///
    /// Transactions are resolved in the order they committed: committed ones
    /// are applied again and finished, ones that never prepared are rolled
    /// back, prepared ones stay in doubt for the coordinator.
    ///
    /// # Errors
    ///
    /// Returns the first apply or write error.
    pub(crate) fn check_xids(&self) -> CoreResult<Resolution> {
        let mut pending: Vec<(Xid, XidStatus)> = {
            let mut registry = self.registry.write();
            registry.by_identifier.clear();
            registry.by_xid.drain().collect()
        };
        pending.sort_by_key(|(_, status)| status.sequence);

        let mut resolution = Resolution::default();
        for (xid, status) in pending {
            let start_position = status
                .start
                .as_ref()
                .map_or_else(|| self.log.written_position(), |s| s.start_position);
            self.log.writer().register_in_flight(
                status.identifier,
                start_position,
                status.tx_id.map(TransactionId::as_u64),
            );

            match (status.state, status.tx_id) {
                (TransactionState::CommitStarted, Some(tx_id)) => {
                    self.collaborators.applier.apply(
                        tx_id,
                        &status.transaction,
                        ApplyMode::Recovery,
                    )?;
                    self.collaborators.generator.committed(
                        &self.data_source,
                        status.identifier,
                        tx_id,
                        None,
                    );
                    self.collaborators.durability.transaction_closed(tx_id);
                    self.log.writer().write_done(status.identifier)?;
                    info!(%tx_id, "recovered committed transaction");
                    resolution.recommitted.push(tx_id);
                }
                (TransactionState::Prepared, _) => {
                    warn!(?xid, "prepared transaction left in doubt");
                    resolution.in_doubt.push(xid.clone());
                    self.registry.write().insert(xid, status);
                }
                _ => {
                    self.log.writer().write_done(status.identifier)?;
                    debug!(?xid, "rolled back unprepared transaction");
                    resolution.rolled_back += 1;
                }
            }
        }
        self.log.writer().write_out()?;
        Ok(resolution)
    }
}
