//! The active log file, its writer and rotation.
//!
//! ## Rotation
//!
//! When the active file grows past the configured size, rotation:
//!
//! 1. Waits for every transaction that has an id to be closed
//! 2. Forces the old file and flushes the store
//! 3. Moves the store to the next log version
//! 4. Prepares `<base>.v<N>.tmp` with a header and copies the entries of
//!    transactions still in flight into it, then syncs and renames it
//! 5. Prunes old versions
//!
//! A crash before the rename leaves the old file active and a temp file
//! that is removed on the next open.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::log::channel::{
    NoNextVersion, PhysicalWritableChannel, ReadAheadChannel, SharedBackend,
};
use crate::log::files::{LogFiles, ReaderLogVersionBridge};
use crate::log::pruning::LogFileInformation;
use crate::store::StoreDurability;
use crate::transaction::{TransactionMetadata, TransactionMetadataCache, TransactionRepresentation};
use crate::types::{current_time_millis, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use txlog_codec::{
    read_log_entry, write_command_entry, write_versioned_log_entry, CodecResult, Command,
    CommitEntry, LogEntry, LogEntryVersion, LogHeader, LogPosition, PositionAware, StartEntry,
    VersionedLogEntry, WritableChannel, Xid,
};

/// Serialization scratch space, so an entry reaches the channel whole or
/// not at all.
#[derive(Debug, Default)]
struct EntryBuffer(Vec<u8>);

impl WritableChannel for EntryBuffer {
    fn put_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.0.extend_from_slice(bytes);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    start_position: LogPosition,
    tx_id: Option<u64>,
}

/// Where the writer stood before a transaction started writing, so a
/// failure can take the log back there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterMark {
    position: LogPosition,
    last_tx_id: u64,
}

/// Tail of the log, readable without taking the writer lock.
#[derive(Debug, Default)]
struct Tail {
    version: AtomicU64,
    offset: AtomicU64,
    last_tx: AtomicU64,
}

/// Writes entries to the active log file.
///
/// Obtained through [`LogFile::writer`], which holds the log's single
/// exclusive lock for as long as the guard lives. The writer keeps track of
/// which transactions have a Start but no Done, so rotation can carry them
/// into the next file.
pub struct LogWriter {
    channel: PhysicalWritableChannel,
    in_flight: BTreeMap<i32, InFlight>,
    next_identifier: i32,
    last_tx_id: u64,
    scratch: EntryBuffer,
    tail: Arc<Tail>,
    /// Set when a roll back could not restore the file; nothing more is
    /// written until the log is reopened and recovered.
    broken: bool,
}

impl LogWriter {
    fn new(channel: PhysicalWritableChannel, last_tx_id: u64, tail: Arc<Tail>) -> Self {
        let writer = Self {
            channel,
            in_flight: BTreeMap::new(),
            next_identifier: 1,
            last_tx_id,
            scratch: EntryBuffer::default(),
            tail,
            broken: false,
        };
        writer.publish();
        writer
    }

    fn publish(&self) {
        let position = self.channel.position();
        self.tail.version.store(position.log_version(), Ordering::Release);
        self.tail.offset.store(position.byte_offset(), Ordering::Release);
        self.tail.last_tx.store(self.last_tx_id, Ordering::Release);
    }

    /// Returns where the next entry will be written.
    #[must_use]
    pub fn position(&self) -> LogPosition {
        self.channel.position()
    }

    /// Returns the id of the last transaction committed into the log.
    #[must_use]
    pub const fn last_tx_id(&self) -> u64 {
        self.last_tx_id
    }

    /// Returns how many transactions have a Start but no Done.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns whether `identifier` has a Start but no Done.
    #[must_use]
    pub fn is_in_flight(&self, identifier: i32) -> bool {
        self.in_flight.contains_key(&identifier)
    }

    /// Returns where an in-flight transaction's Start entry currently is.
    pub(crate) fn start_position(&self, identifier: i32) -> Option<LogPosition> {
        self.in_flight.get(&identifier).map(|f| f.start_position)
    }

    fn earliest_in_flight(&self) -> Option<LogPosition> {
        self.in_flight.values().map(|f| f.start_position).min()
    }

    /// Allocates a session identifier, wrapping back to 1.
    pub fn next_identifier(&mut self) -> i32 {
        loop {
            let identifier = self.next_identifier;
            self.next_identifier = if identifier == i32::MAX { 1 } else { identifier + 1 };
            if !self.in_flight.contains_key(&identifier) {
                return identifier;
            }
        }
    }

    pub(crate) fn observe_identifier(&mut self, identifier: i32) {
        if identifier >= self.next_identifier {
            self.next_identifier = identifier.checked_add(1).unwrap_or(1);
        }
    }

    pub(crate) fn observe_tx_id(&mut self, tx_id: u64) {
        if tx_id > self.last_tx_id {
            self.last_tx_id = tx_id;
            self.tail.last_tx.store(tx_id, Ordering::Release);
        }
    }

    /// Registers a transaction found in flight by recovery.
    pub(crate) fn register_in_flight(
        &mut self,
        identifier: i32,
        start_position: LogPosition,
        tx_id: Option<u64>,
    ) {
        self.observe_identifier(identifier);
        self.in_flight.insert(
            identifier,
            InFlight {
                start_position,
                tx_id,
            },
        );
    }

    /// Returns a mark to [`roll_back`](Self::roll_back) to.
    #[must_use]
    pub fn mark(&self) -> WriterMark {
        WriterMark {
            position: self.position(),
            last_tx_id: self.last_tx_id,
        }
    }

    /// Takes the log back to `mark`, as if nothing had been written since.
    ///
    /// Entries written after the mark are cut from the file and the buffer,
    /// transactions started after it are forgotten and the last committed
    /// id is restored. If the file cannot be cut back the writer refuses
    /// further writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the mark is in another log version or the file
    /// cannot be truncated.
    pub fn roll_back(&mut self, mark: WriterMark) -> CoreResult<()> {
        if mark.position.log_version() != self.channel.log_version() {
            self.broken = true;
            return Err(CoreError::illegal_state(format!(
                "cannot roll back to version {} while writing version {}",
                mark.position.log_version(),
                self.channel.log_version()
            )));
        }
        if let Err(e) = self.channel.truncate_to(mark.position.byte_offset()) {
            self.broken = true;
            error!(position = %mark.position, error = %e, "could not roll back log, writes disabled");
            return Err(e);
        }
        self.in_flight.retain(|_, f| f.start_position < mark.position);
        for flight in self.in_flight.values_mut() {
            if flight.tx_id.is_some_and(|id| id > mark.last_tx_id) {
                flight.tx_id = None;
            }
        }
        self.last_tx_id = mark.last_tx_id;
        self.publish();
        debug!(position = %mark.position, "rolled back log");
        Ok(())
    }

    fn ensure_usable(&self) -> CoreResult<()> {
        if self.broken {
            Err(CoreError::illegal_state(
                "log writer failed to roll back and needs recovery",
            ))
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, version: LogEntryVersion, entry: &LogEntry) -> CoreResult<()> {
        self.ensure_usable()?;
        self.scratch.0.clear();
        write_versioned_log_entry(&mut self.scratch, version, entry)?;
        self.channel.put_bytes(&self.scratch.0)?;
        Ok(())
    }

    fn require_in_flight(&self, identifier: i32) -> CoreResult<()> {
        if self.in_flight.contains_key(&identifier) {
            Ok(())
        } else {
            Err(CoreError::illegal_state(format!(
                "no started transaction with identifier {identifier}"
            )))
        }
    }

    /// Writes a Start entry for a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn write_start(
        &mut self,
        identifier: i32,
        xid: Xid,
        transaction: &TransactionRepresentation,
    ) -> CoreResult<StartEntry> {
        self.write_start_entry(
            StartEntry {
                identifier,
                xid,
                master_id: transaction.master_id,
                author_id: transaction.author_id,
                start_position: self.position(),
                time_written: transaction.time_started,
                last_committed_tx_when_started: transaction.last_committed_tx_when_started,
                additional_header: transaction.additional_header.clone(),
            },
            LogEntryVersion::CURRENT,
        )
    }

    /// Writes a prepared Start entry, stamping it with its position.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is already in flight or the entry
    /// cannot be written.
    pub fn write_start_entry(
        &mut self,
        mut start: StartEntry,
        version: LogEntryVersion,
    ) -> CoreResult<StartEntry> {
        if self.in_flight.contains_key(&start.identifier) {
            return Err(CoreError::illegal_state(format!(
                "identifier {} is already in flight",
                start.identifier
            )));
        }
        start.start_position = self.position();
        self.emit(version, &LogEntry::Start(start.clone()))?;
        self.observe_identifier(start.identifier);
        self.in_flight.insert(
            start.identifier,
            InFlight {
                start_position: start.start_position,
                tx_id: None,
            },
        );
        Ok(start)
    }

    /// Writes a Command entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction was not started or the entry
    /// cannot be written.
    pub fn write_command(&mut self, identifier: i32, command: &Command) -> CoreResult<()> {
        self.ensure_usable()?;
        self.require_in_flight(identifier)?;
        self.scratch.0.clear();
        write_command_entry(&mut self.scratch, identifier, command)?;
        self.channel.put_bytes(&self.scratch.0)?;
        Ok(())
    }

    /// Writes a Prepare entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction was not started or the entry
    /// cannot be written.
    pub fn write_prepare(&mut self, identifier: i32) -> CoreResult<()> {
        self.require_in_flight(identifier)?;
        self.emit(
            LogEntryVersion::CURRENT,
            &LogEntry::Prepare {
                identifier,
                time_written: current_time_millis(),
            },
        )
    }

    /// Writes a one-phase or two-phase Commit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction was not started or the entry
    /// cannot be written.
    pub fn write_commit(
        &mut self,
        identifier: i32,
        tx_id: TransactionId,
        two_phase: bool,
    ) -> CoreResult<CommitEntry> {
        self.require_in_flight(identifier)?;
        let commit = CommitEntry {
            identifier,
            tx_id: tx_id.as_u64(),
            time_written: current_time_millis(),
        };
        let entry = if two_phase {
            LogEntry::TwoPhaseCommit(commit)
        } else {
            LogEntry::OnePhaseCommit(commit)
        };
        self.emit(LogEntryVersion::CURRENT, &entry)?;
        if let Some(flight) = self.in_flight.get_mut(&identifier) {
            flight.tx_id = Some(tx_id.as_u64());
        }
        self.observe_tx_id(tx_id.as_u64());
        Ok(commit)
    }

    /// Writes a Done entry; nothing more is written for the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction was not started or the entry
    /// cannot be written.
    pub fn write_done(&mut self, identifier: i32) -> CoreResult<()> {
        self.require_in_flight(identifier)?;
        self.emit(LogEntryVersion::CURRENT, &LogEntry::Done { identifier })?;
        self.in_flight.remove(&identifier);
        Ok(())
    }

    /// Ends a failed transaction with a Done entry, as far as that is still
    /// possible, and stops tracking it.
    pub(crate) fn abandon(&mut self, identifier: i32) {
        if self.in_flight.contains_key(&identifier) {
            if let Err(e) = self.write_done(identifier) {
                warn!(identifier, error = %e, "could not mark failed transaction done");
            }
            self.in_flight.remove(&identifier);
        }
    }

    /// Hands buffered entries to the file, without forcing them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file rejects the write.
    pub fn write_out(&mut self) -> CoreResult<()> {
        self.ensure_usable()?;
        self.channel.write_out()?;
        self.publish();
        Ok(())
    }

    /// Writes out and forces the active file.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub fn force(&mut self) -> CoreResult<()> {
        self.ensure_usable()?;
        self.channel.force()?;
        self.publish();
        Ok(())
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("position", &self.position())
            .field("in_flight", &self.in_flight.len())
            .field("last_tx_id", &self.last_tx_id)
            .finish_non_exhaustive()
    }
}

/// The log: the active file, its rotated predecessors and the lock that
/// serializes writes.
pub struct LogFile {
    files: LogFiles,
    config: Config,
    durability: Arc<dyn StoreDurability>,
    cache: Arc<TransactionMetadataCache>,
    writer: Mutex<LogWriter>,
    force_handle: Mutex<SharedBackend>,
    tail: Arc<Tail>,
}

impl LogFile {
    /// Opens the newest log version for writing, or creates the first one
    /// at the store's current log version.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be listed, opened or created,
    /// or the newest header is unreadable.
    pub fn open(
        files: LogFiles,
        config: Config,
        durability: Arc<dyn StoreDurability>,
        cache: Arc<TransactionMetadataCache>,
    ) -> CoreResult<Self> {
        let store_last = durability.last_committed_tx().as_u64();
        let (version, backend, prev_committed) = match files.highest_version()? {
            Some(version) => {
                let header = files.read_header(version, config.strict_format_check)?;
                let backend = files.open(version)?;
                debug!(version, prev = header.last_committed_tx_id, "opened existing log");
                (version, backend, header.last_committed_tx_id)
            }
            None => {
                let version = durability.current_log_version();
                let backend = create_version(&files, version, store_last)?;
                info!(version, "created log");
                (version, backend, store_last)
            }
        };
        cache.cache_header(version, prev_committed);

        let backend: SharedBackend = Arc::new(Mutex::new(backend));
        let channel =
            PhysicalWritableChannel::new(Arc::clone(&backend), version, config.write_buffer_size)?;
        let tail = Arc::new(Tail::default());
        let writer = LogWriter::new(channel, prev_committed.max(store_last), Arc::clone(&tail));

        Ok(Self {
            files,
            config,
            durability,
            cache,
            writer: Mutex::new(writer),
            force_handle: Mutex::new(backend),
            tail,
        })
    }

    /// Returns the log files.
    #[must_use]
    pub fn files(&self) -> &LogFiles {
        &self.files
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the metadata cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<TransactionMetadataCache> {
        &self.cache
    }

    /// Returns the version being written.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.tail.version.load(Ordering::Acquire)
    }

    /// Returns the id of the last transaction committed into the log.
    #[must_use]
    pub fn last_written_tx_id(&self) -> u64 {
        self.tail.last_tx.load(Ordering::Acquire)
    }

    /// Returns the end of the written-out log.
    #[must_use]
    pub fn written_position(&self) -> LogPosition {
        LogPosition::new(
            self.tail.version.load(Ordering::Acquire),
            self.tail.offset.load(Ordering::Acquire),
        )
    }

    /// Takes the log's exclusive lock and returns the writer.
    pub fn writer(&self) -> MutexGuard<'_, LogWriter> {
        self.writer.lock()
    }

    /// Rotates if the active file has outgrown the threshold.
    ///
    /// The size is checked once without the lock and again with it, since
    /// another thread may have rotated in between.
    ///
    /// # Errors
    ///
    /// Returns an error if rotation fails.
    pub fn check_rotation(&self) -> CoreResult<bool> {
        if self.tail.offset.load(Ordering::Acquire) < self.config.rotate_at_size {
            return Ok(false);
        }
        let mut writer = self.writer.lock();
        self.rotate_if_needed(&mut writer)
    }

    /// Rotates if the active file has outgrown the threshold, with the
    /// writer already held.
    ///
    /// Rotation is put off while transactions in flight span more than
    /// half the threshold, since copying them forward would make the new
    /// file due for rotation straight away.
    ///
    /// # Errors
    ///
    /// Returns an error if rotation fails.
    pub fn rotate_if_needed(&self, writer: &mut LogWriter) -> CoreResult<bool> {
        let position = writer.position();
        if position.byte_offset() < self.config.rotate_at_size {
            return Ok(false);
        }
        if let Some(earliest) = writer.earliest_in_flight() {
            let span = position.byte_offset().saturating_sub(earliest.byte_offset());
            if span > self.config.rotate_at_size / 2 {
                debug!(span, "postponing rotation, in-flight transactions too large");
                return Ok(false);
            }
        }
        self.rotate_locked(writer)?;
        Ok(true)
    }

    /// Rotates regardless of size.
    ///
    /// Returns the position of the first entry in the new file.
    ///
    /// # Errors
    ///
    /// Returns an error if rotation fails.
    pub fn rotate(&self) -> CoreResult<LogPosition> {
        let mut writer = self.writer.lock();
        self.rotate_locked(&mut writer)?;
        Ok(writer.position())
    }

    fn rotate_locked(&self, writer: &mut LogWriter) -> CoreResult<()> {
        writer.ensure_usable()?;
        let old_version = writer.channel.log_version();
        let new_version = old_version + 1;
        info!(from = old_version, to = new_version, "rotating log");

        self.durability
            .await_all_transactions_closed(self.config.rotation_quiesce_timeout)?;
        writer.channel.force()?;
        self.durability.flush_all()?;
        let store_version = self.durability.get_and_set_new_log_version();
        if store_version != old_version {
            warn!(store_version, log_version = old_version, "store and log disagree on log version");
        }

        let prev_committed = writer.last_tx_id;
        let temp = self.files.temp_path(new_version);
        let backend: SharedBackend = Arc::new(Mutex::new(self.files.fs().create(&temp)?));
        let mut channel = PhysicalWritableChannel::new(
            Arc::clone(&backend),
            new_version,
            self.config.write_buffer_size,
        )?;
        LogHeader::new(new_version, prev_committed).write_to(&mut channel)?;
        let copied = self.copy_in_flight(writer, old_version, &mut channel)?;
        channel.force()?;
        self.files
            .fs()
            .rename(&temp, &self.files.version_path(new_version))?;

        writer.channel = channel;
        *self.force_handle.lock() = backend;
        writer.publish();
        self.cache.cache_header(new_version, prev_committed);

        let pruned = self.config.prune_strategy.prune(new_version, &self.files, self)?;
        for version in &pruned {
            self.cache.forget_header(*version);
        }
        info!(version = new_version, copied, pruned = pruned.len(), "log rotated");
        Ok(())
    }

    /// Copies the entries of in-flight transactions into the new file and
    /// points their start positions at the copies.
    fn copy_in_flight(
        &self,
        writer: &mut LogWriter,
        old_version: u64,
        target: &mut PhysicalWritableChannel,
    ) -> CoreResult<usize> {
        let Some(from) = writer.earliest_in_flight() else {
            return Ok(0);
        };
        if from.log_version() != old_version {
            return Err(CoreError::illegal_state(format!(
                "in-flight transaction starts at {from}, outside version {old_version}"
            )));
        }

        let mut reader = ReadAheadChannel::new(
            self.files.open(old_version)?,
            from,
            self.config.read_ahead_size,
            Arc::new(NoNextVersion),
        );
        let mut scratch = EntryBuffer::default();
        let mut copied = 0;
        while let Some(versioned) = read_log_entry(&mut reader)? {
            let identifier = versioned.entry.identifier();
            let Some(flight) = writer.in_flight.get_mut(&identifier) else {
                continue;
            };
            if let LogEntry::Start(start) = &versioned.entry {
                flight.start_position = target.position();
                if let Some(tx_id) = flight.tx_id {
                    self.cache.cache_transaction(
                        TransactionId::new(tx_id),
                        TransactionMetadata {
                            start_position: flight.start_position,
                            master_id: start.master_id,
                            author_id: start.author_id,
                            checksum: start.checksum(),
                        },
                    );
                }
            }
            scratch.0.clear();
            write_versioned_log_entry(&mut scratch, versioned.version, &versioned.entry)?;
            target.put_bytes(&scratch.0)?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Forces everything written out so far to durable storage.
    ///
    /// Does not take the writer lock, so committers can force while others
    /// append.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn force(&self) -> CoreResult<()> {
        let backend = Arc::clone(&*self.force_handle.lock());
        let mut backend = backend.lock();
        backend.flush()?;
        backend.sync()?;
        Ok(())
    }

    /// Opens a reader at `position` that follows the log across rotations.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchLogVersion`] if the version does not exist.
    pub fn reader(&self, position: LogPosition) -> CoreResult<ReadAheadChannel> {
        let backend = self.files.open(position.log_version())?;
        Ok(ReadAheadChannel::new(
            backend,
            position,
            self.config.read_ahead_size,
            Arc::new(ReaderLogVersionBridge::new(
                self.files.clone(),
                self.config.strict_format_check,
            )),
        ))
    }

    /// Opens a reader confined to one log version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchLogVersion`] if the version does not exist.
    pub fn version_reader(&self, position: LogPosition) -> CoreResult<ReadAheadChannel> {
        let backend = self.files.open(position.log_version())?;
        Ok(ReadAheadChannel::new(
            backend,
            position,
            self.config.read_ahead_size,
            Arc::new(NoNextVersion),
        ))
    }

    /// Feeds every entry from `from` onwards to `visitor`, until the log
    /// ends or the visitor returns `Ok(false)`.
    ///
    /// The visitor gets each entry with the position it starts at. Returns
    /// the position after the last entry read.
    ///
    /// # Errors
    ///
    /// Returns the first error from reading or from the visitor.
    pub fn accept<F>(&self, from: LogPosition, mut visitor: F) -> CoreResult<LogPosition>
    where
        F: FnMut(LogPosition, &VersionedLogEntry) -> CoreResult<bool>,
    {
        let mut reader = self.reader(from)?;
        loop {
            let position = reader.current_position();
            match read_log_entry(&mut reader)? {
                Some(entry) => {
                    if !visitor(position, &entry)? {
                        return Ok(reader.current_position());
                    }
                }
                None => return Ok(position),
            }
        }
    }

    /// Returns the last transaction id committed before `version` began.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchLogVersion`] if the version does not exist.
    pub fn prev_committed_tx(&self, version: u64) -> CoreResult<u64> {
        if let Some(prev) = self.cache.header(version) {
            return Ok(prev);
        }
        let header = self
            .files
            .read_header(version, self.config.strict_format_check)?;
        self.cache.cache_header(version, header.last_committed_tx_id);
        Ok(header.last_committed_tx_id)
    }

    /// Cuts the active file back to `position`, dropping a torn tail.
    ///
    /// # Errors
    ///
    /// Returns an error if `position` is not in the active file or the file
    /// cannot be truncated.
    pub(crate) fn truncate_tail(&self, position: LogPosition) -> CoreResult<()> {
        let mut writer = self.writer.lock();
        let version = writer.channel.log_version();
        if position.log_version() != version {
            return Err(CoreError::illegal_state(format!(
                "cannot truncate version {} while writing version {version}",
                position.log_version()
            )));
        }
        writer.channel.write_out()?;
        let backend = writer.channel.backend();
        {
            let mut file = backend.lock();
            file.truncate(position.byte_offset())?;
            file.sync()?;
        }
        writer.channel =
            PhysicalWritableChannel::new(backend, version, self.config.write_buffer_size)?;
        writer.publish();
        Ok(())
    }

    /// Forces the active file.
    ///
    /// # Errors
    ///
    /// Returns an error if the force fails.
    pub fn close(&self) -> CoreResult<()> {
        self.writer.lock().force()
    }
}

impl LogFileInformation for LogFile {
    fn first_committed_tx(&self, version: u64) -> CoreResult<Option<u64>> {
        if !self.files.exists(version) {
            return Ok(None);
        }
        Ok(Some(self.prev_committed_tx(version)? + 1))
    }

    fn first_start_time(&self, version: u64) -> CoreResult<Option<i64>> {
        if !self.files.exists(version) {
            return Ok(None);
        }
        let mut reader = self.version_reader(LogPosition::start_of(version))?;
        while let Some(versioned) = read_log_entry(&mut reader)? {
            if let LogEntry::Start(start) = versioned.entry {
                return Ok(Some(start.time_written));
            }
        }
        Ok(None)
    }

    fn last_committed_tx(&self) -> u64 {
        self.last_written_tx_id()
    }
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("files", &self.files)
            .field("written", &self.written_position())
            .finish_non_exhaustive()
    }
}

/// Creates a log version through a temp file, so a half-written header
/// never carries the version's name.
fn create_version(
    files: &LogFiles,
    version: u64,
    prev_committed: u64,
) -> CoreResult<Box<dyn txlog_storage::StorageBackend>> {
    let temp = files.temp_path(version);
    let mut backend = files.fs().create(&temp)?;
    backend.append(&LogHeader::new(version, prev_committed).encode()?)?;
    backend.sync()?;
    files.fs().rename(&temp, &files.version_path(version))?;
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreDurability, TransactionIdStore};
    use crate::types::new_xid;
    use txlog_codec::{NodeCommand, LOG_HEADER_SIZE};
    use txlog_storage::InMemoryFileSystem;

    fn node(id: u64) -> Command {
        Command::Node(NodeCommand {
            id,
            before: None,
            after: None,
        })
    }

    fn open(fs: &InMemoryFileSystem, config: Config) -> (LogFile, Arc<TransactionIdStore>) {
        let store = Arc::new(TransactionIdStore::new(0, 0));
        let files = LogFiles::new(Arc::new(fs.clone()), "db", "log");
        let cache = Arc::new(TransactionMetadataCache::new(100, 100));
        let log = LogFile::open(files, config, store.clone(), cache).unwrap();
        (log, store)
    }

    /// Writes a whole committed transaction and closes it in the store.
    fn commit(log: &LogFile, store: &TransactionIdStore, commands: usize) -> TransactionId {
        use crate::store::TransactionIdGenerator;
        let tx = TransactionRepresentation::new((0..commands as u64).map(node).collect());
        let mut writer = log.writer();
        let identifier = writer.next_identifier();
        writer.write_start(identifier, new_xid("test"), &tx).unwrap();
        for command in tx.commands() {
            writer.write_command(identifier, command).unwrap();
        }
        let tx_id = store.generate(&tx).unwrap();
        writer.write_commit(identifier, tx_id, false).unwrap();
        writer.write_done(identifier).unwrap();
        writer.write_out().unwrap();
        store.committed("test", identifier, tx_id, None);
        store.transaction_closed(tx_id);
        tx_id
    }

    fn entries(log: &LogFile, from: LogPosition) -> Vec<LogEntry> {
        let mut seen = Vec::new();
        log.accept(from, |_, e| {
            seen.push(e.entry.clone());
            Ok(true)
        })
        .unwrap();
        seen
    }

    #[test]
    fn creates_first_version_with_header() {
        let fs = InMemoryFileSystem::new();
        let (log, _) = open(&fs, Config::default());
        assert_eq!(log.current_version(), 0);
        assert_eq!(log.written_position(), LogPosition::start_of(0));
        let header = log.files().read_header(0, true).unwrap();
        assert_eq!(header.last_committed_tx_id, 0);
    }

    #[test]
    fn reopen_continues_at_end() {
        let fs = InMemoryFileSystem::new();
        let end = {
            let (log, store) = open(&fs, Config::default());
            commit(&log, &store, 2);
            log.close().unwrap();
            log.written_position()
        };
        let (log, _) = open(&fs, Config::default());
        assert_eq!(log.written_position(), end);
    }

    #[test]
    fn identifiers_wrap_to_one() {
        let fs = InMemoryFileSystem::new();
        let (log, _) = open(&fs, Config::default());
        let mut writer = log.writer();
        writer.next_identifier = i32::MAX;
        assert_eq!(writer.next_identifier(), i32::MAX);
        assert_eq!(writer.next_identifier(), 1);
    }

    #[test]
    fn roll_back_forgets_writes_after_mark() {
        let fs = InMemoryFileSystem::new();
        let (log, store) = open(&fs, Config::default());
        commit(&log, &store, 1);
        let tx = TransactionRepresentation::new(vec![node(1)]);

        let mut writer = log.writer();
        let earlier = writer.next_identifier();
        writer.write_start(earlier, new_xid("test"), &tx).unwrap();
        let mark = writer.mark();

        let later = writer.next_identifier();
        writer.write_start(later, new_xid("test"), &tx).unwrap();
        writer.write_command(later, &node(2)).unwrap();
        writer.write_commit(earlier, TransactionId::new(2), true).unwrap();
        writer.write_out().unwrap();

        writer.roll_back(mark).unwrap();
        assert_eq!(writer.position(), mark.position);
        assert_eq!(writer.last_tx_id(), 1);
        assert!(writer.is_in_flight(earlier));
        assert!(!writer.is_in_flight(later));
        writer.write_done(earlier).unwrap();
        writer.write_out().unwrap();
        drop(writer);

        let on_disk = fs.file_bytes(&log.files().version_path(0)).unwrap().len() as u64;
        assert_eq!(log.written_position().byte_offset(), on_disk);
        let kinds: Vec<u8> = entries(&log, LogPosition::start_of(0))
            .iter()
            .map(|e| e.type_byte())
            .collect();
        assert_eq!(kinds, vec![1, 3, 5, 4, 1, 4]);
    }

    #[test]
    fn failed_roll_back_stops_writes() {
        let fs = InMemoryFileSystem::new();
        let (log, store) = open(&fs, Config::default());
        commit(&log, &store, 1);
        let mark = log.writer().mark();
        log.rotate().unwrap();

        let mut writer = log.writer();
        assert!(writer.roll_back(mark).is_err());
        let identifier = writer.next_identifier();
        let tx = TransactionRepresentation::new(vec![node(1)]);
        assert!(writer.write_start(identifier, new_xid("test"), &tx).is_err());
        assert!(writer.write_out().is_err());
        assert!(writer.force().is_err());
    }

    #[test]
    fn commands_need_a_start() {
        let fs = InMemoryFileSystem::new();
        let (log, _) = open(&fs, Config::default());
        let err = log.writer().write_command(9, &node(1)).unwrap_err();
        assert!(matches!(err, CoreError::IllegalState { .. }));
    }

    #[test]
    fn rotation_writes_header_and_bumps_version() {
        let fs = InMemoryFileSystem::new();
        let (log, store) = open(&fs, Config::default());
        commit(&log, &store, 2);
        commit(&log, &store, 2);

        let position = log.rotate().unwrap();
        assert_eq!(position, LogPosition::start_of(1));
        assert_eq!(log.current_version(), 1);
        assert_eq!(store.current_log_version(), 1);
        assert_eq!(log.prev_committed_tx(1).unwrap(), 2);
        assert_eq!(log.files().versions().unwrap(), vec![0, 1]);
        assert_eq!(store.flush_count(), 1);
    }

    #[test]
    fn check_rotation_respects_threshold() {
        let fs = InMemoryFileSystem::new();
        let (log, store) = open(&fs, Config::default().rotate_at_size(200));
        assert!(!log.check_rotation().unwrap());
        while log.written_position().byte_offset() < 200 {
            commit(&log, &store, 1);
        }
        assert!(log.check_rotation().unwrap());
        assert_eq!(log.current_version(), 1);
        assert!(!log.check_rotation().unwrap());
    }

    #[test]
    fn rotation_copies_in_flight_transactions() {
        let fs = InMemoryFileSystem::new();
        let (log, store) = open(&fs, Config::default());
        commit(&log, &store, 1);

        let open_identifier = {
            let mut writer = log.writer();
            let identifier = writer.next_identifier();
            let tx = TransactionRepresentation::new(vec![node(7)]);
            writer.write_start(identifier, new_xid("test"), &tx).unwrap();
            writer.write_command(identifier, &node(7)).unwrap();
            writer.write_out().unwrap();
            identifier
        };
        commit(&log, &store, 1);

        log.rotate().unwrap();
        let copied = entries(&log, LogPosition::start_of(1));
        assert_eq!(copied.len(), 2);
        assert!(matches!(&copied[0], LogEntry::Start(s) if s.identifier == open_identifier));
        assert!(matches!(&copied[1], LogEntry::Command { identifier, .. } if *identifier == open_identifier));

        // The transaction can finish in the new file.
        let mut writer = log.writer();
        assert!(writer.is_in_flight(open_identifier));
        writer.write_done(open_identifier).unwrap();
        assert_eq!(writer.in_flight_count(), 0);
    }

    #[test]
    fn reader_streams_across_rotation() {
        let fs = InMemoryFileSystem::new();
        let (log, store) = open(&fs, Config::default());
        commit(&log, &store, 1);
        log.rotate().unwrap();
        commit(&log, &store, 1);

        let all = entries(&log, LogPosition::start_of(0));
        let commits: Vec<u64> = all.iter().filter_map(|e| e.as_commit()).map(|c| c.tx_id).collect();
        assert_eq!(commits, vec![1, 2]);
    }

    #[test]
    fn rotation_prunes() {
        let fs = InMemoryFileSystem::new();
        let config = Config::default().prune_strategy(crate::log::LogPruneStrategy::Files(1));
        let (log, store) = open(&fs, config);
        for _ in 0..4 {
            commit(&log, &store, 1);
            log.rotate().unwrap();
        }
        assert_eq!(log.files().versions().unwrap(), vec![3, 4]);
    }

    #[test]
    fn rotation_times_out_on_open_transaction() {
        use crate::store::TransactionIdGenerator;
        let fs = InMemoryFileSystem::new();
        let config =
            Config::default().rotation_quiesce_timeout(Some(std::time::Duration::from_millis(10)));
        let (log, store) = open(&fs, config);
        store.generate(&TransactionRepresentation::new(Vec::new())).unwrap();

        let err = log.rotate().unwrap_err();
        assert!(matches!(err, CoreError::RotationTimeout { .. }));
        assert_eq!(log.current_version(), 0);
    }

    #[test]
    fn truncate_tail_drops_garbage() {
        let fs = InMemoryFileSystem::new();
        let (log, store) = open(&fs, Config::default());
        commit(&log, &store, 1);
        let good = log.written_position();
        {
            let mut writer = log.writer();
            writer.channel.put_bytes(&[1, 0, 0]).unwrap();
            writer.write_out().unwrap();
        }
        log.truncate_tail(good).unwrap();
        assert_eq!(log.written_position(), good);
        assert_eq!(log.files().size(0).unwrap(), good.byte_offset());
    }

    #[test]
    fn file_information() {
        let fs = InMemoryFileSystem::new();
        let (log, store) = open(&fs, Config::default());
        commit(&log, &store, 1);
        commit(&log, &store, 1);
        log.rotate().unwrap();
        commit(&log, &store, 1);

        assert_eq!(log.first_committed_tx(0).unwrap(), Some(1));
        assert_eq!(log.first_committed_tx(1).unwrap(), Some(3));
        assert_eq!(log.first_committed_tx(9).unwrap(), None);
        assert!(log.first_start_time(1).unwrap().is_some());
        assert_eq!(log.last_committed_tx(), 3);
        assert!(log.files().size(1).unwrap() > LOG_HEADER_SIZE as u64);
    }
}
