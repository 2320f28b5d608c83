//! Log entries.
//!
//! ## Entry Format
//!
//! ```text
//! | [version (1)] | type (1) | identifier (4) | variant fields |
//! ```
//!
//! Entries in the current format carry no version byte. Entries written in
//! an older format are prefixed with their version byte, which always has
//! the high bit set, so a reader can tell it apart from a type byte.
//!
//! | Type | Fields after the identifier |
//! |------|-----------------------------|
//! | `TX_START` | xid, master id, author id, time written, last committed tx, additional header (V2 only) |
//! | `TX_PREPARE` | time written |
//! | `COMMAND` | one [`Command`] |
//! | `DONE` | nothing |
//! | `TX_1P_COMMIT` / `TX_2P_COMMIT` | tx id, time written |
//!
//! A zero type byte marks the end of the entries: preallocated or
//! zero-filled space reads as "no more entries".

use crate::channel::{PositionAware, ReadableChannel, WritableChannel};
use crate::command::{get_len, put_len, Command};
use crate::error::{CodecError, CodecResult};
use crate::position::LogPosition;
use sha2::{Digest, Sha256};

/// Entry type bytes.
pub mod entry_type {
    /// End of entries.
    pub const EMPTY: u8 = 0;
    /// Transaction start.
    pub const TX_START: u8 = 1;
    /// Two-phase prepare.
    pub const TX_PREPARE: u8 = 2;
    /// Store command.
    pub const COMMAND: u8 = 3;
    /// Transaction finished.
    pub const DONE: u8 = 4;
    /// One-phase commit.
    pub const TX_1P_COMMIT: u8 = 5;
    /// Two-phase commit.
    pub const TX_2P_COMMIT: u8 = 6;
}

/// Maximum length of an Xid's global or branch part.
pub const MAX_XID_PART: usize = 64;

/// Entry format versions.
///
/// Version bytes are negative when read as `i8`, which keeps them
/// distinguishable from type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogEntryVersion {
    /// Start entries without additional header bytes.
    V1,
    /// Current format.
    V2,
}

impl LogEntryVersion {
    /// The version written by default.
    pub const CURRENT: Self = Self::V2;

    /// Every version this crate reads and writes.
    pub const ALL: [Self; 2] = [Self::V1, Self::V2];

    /// Returns the on-disk version byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::V1 => -1i8 as u8,
            Self::V2 => -2i8 as u8,
        }
    }

    /// Parses a version byte.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownEntryVersion`] for an unknown byte.
    pub fn from_byte(byte: u8) -> CodecResult<Self> {
        match byte as i8 {
            -1 => Ok(Self::V1),
            -2 => Ok(Self::V2),
            _ => Err(CodecError::UnknownEntryVersion { version_byte: byte }),
        }
    }
}

/// A global transaction identifier used for coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    /// Format identifier of the coordinator.
    pub format_id: i32,
    /// Global transaction part, at most [`MAX_XID_PART`] bytes.
    pub global_id: Vec<u8>,
    /// Branch qualifier, at most [`MAX_XID_PART`] bytes.
    pub branch_id: Vec<u8>,
}

impl Xid {
    /// Creates an Xid.
    #[must_use]
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch_id: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_id: branch_id.into(),
        }
    }

    fn write_to<C: WritableChannel + ?Sized>(&self, ch: &mut C) -> CodecResult<()> {
        if self.global_id.len() > MAX_XID_PART || self.branch_id.len() > MAX_XID_PART {
            return Err(CodecError::invalid_structure("xid part longer than 64 bytes"));
        }
        ch.put_i32(self.format_id)?;
        ch.put_u8(self.global_id.len() as u8)?;
        ch.put_u8(self.branch_id.len() as u8)?;
        ch.put_bytes(&self.global_id)?;
        ch.put_bytes(&self.branch_id)
    }

    fn read_from<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<Self> {
        let format_id = ch.get_i32()?;
        let global_len = usize::from(ch.get_u8()?);
        let branch_len = usize::from(ch.get_u8()?);
        if global_len > MAX_XID_PART || branch_len > MAX_XID_PART {
            return Err(CodecError::invalid_structure("xid part longer than 64 bytes"));
        }
        let global_id = ch.get_vec(global_len)?;
        let branch_id = ch.get_vec(branch_len)?;
        Ok(Self {
            format_id,
            global_id,
            branch_id,
        })
    }
}

/// The first entry of every transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartEntry {
    /// Session-scoped identifier correlating this transaction's entries.
    pub identifier: i32,
    /// Coordination id.
    pub xid: Xid,
    /// Instance the transaction originated on.
    pub master_id: i32,
    /// Instance that authored the transaction.
    pub author_id: i32,
    /// Where this entry was read from; not stored on disk.
    pub start_position: LogPosition,
    /// Wall clock millis when written.
    pub time_written: i64,
    /// Last committed transaction id when this transaction started.
    pub last_committed_tx_when_started: u64,
    /// Opaque bytes carried for the store (absent in V1).
    pub additional_header: Vec<u8>,
}

impl StartEntry {
    /// Checksum over the xid and the master/author ids.
    ///
    /// Two logs holding the same transaction agree on this value, which is
    /// how a receiver checks a shipped transaction against its own copy.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.xid.format_id.to_be_bytes());
        hasher.update(&self.xid.global_id);
        hasher.update(&self.xid.branch_id);
        hasher.update(self.master_id.to_be_bytes());
        hasher.update(self.author_id.to_be_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }
}

/// A one-phase or two-phase commit marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEntry {
    /// Session-scoped identifier.
    pub identifier: i32,
    /// Durable transaction id assigned at commit.
    pub tx_id: u64,
    /// Wall clock millis when written.
    pub time_written: i64,
}

/// A single log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Transaction start.
    Start(StartEntry),
    /// Two-phase prepare.
    Prepare {
        /// Session-scoped identifier.
        identifier: i32,
        /// Wall clock millis when written.
        time_written: i64,
    },
    /// One-phase commit.
    OnePhaseCommit(CommitEntry),
    /// Two-phase commit.
    TwoPhaseCommit(CommitEntry),
    /// Transaction finished; nothing more will be written for it.
    Done {
        /// Session-scoped identifier.
        identifier: i32,
    },
    /// Store mutation.
    Command {
        /// Session-scoped identifier.
        identifier: i32,
        /// The mutation.
        command: Command,
    },
}

impl LogEntry {
    /// Returns the identifier of the transaction this entry belongs to.
    #[must_use]
    pub const fn identifier(&self) -> i32 {
        match self {
            Self::Start(start) => start.identifier,
            Self::OnePhaseCommit(commit) | Self::TwoPhaseCommit(commit) => commit.identifier,
            Self::Prepare { identifier, .. }
            | Self::Done { identifier }
            | Self::Command { identifier, .. } => *identifier,
        }
    }

    /// Returns the entry type byte.
    #[must_use]
    pub const fn type_byte(&self) -> u8 {
        match self {
            Self::Start(_) => entry_type::TX_START,
            Self::Prepare { .. } => entry_type::TX_PREPARE,
            Self::OnePhaseCommit(_) => entry_type::TX_1P_COMMIT,
            Self::TwoPhaseCommit(_) => entry_type::TX_2P_COMMIT,
            Self::Done { .. } => entry_type::DONE,
            Self::Command { .. } => entry_type::COMMAND,
        }
    }

    /// Returns the commit marker, if this is one.
    #[must_use]
    pub const fn as_commit(&self) -> Option<&CommitEntry> {
        match self {
            Self::OnePhaseCommit(commit) | Self::TwoPhaseCommit(commit) => Some(commit),
            _ => None,
        }
    }
}

/// An entry together with the format version it was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLogEntry {
    /// Format version.
    pub version: LogEntryVersion,
    /// The entry.
    pub entry: LogEntry,
}

/// Writes an entry in the current format.
///
/// # Errors
///
/// Returns an error if a field cannot be framed or the channel fails.
pub fn write_log_entry<C: WritableChannel + ?Sized>(ch: &mut C, entry: &LogEntry) -> CodecResult<()> {
    write_versioned_log_entry(ch, LogEntryVersion::CURRENT, entry)
}

/// Writes an entry in the given format.
///
/// # Errors
///
/// Returns an error if a field cannot be framed or the channel fails.
pub fn write_versioned_log_entry<C: WritableChannel + ?Sized>(
    ch: &mut C,
    version: LogEntryVersion,
    entry: &LogEntry,
) -> CodecResult<()> {
    if version != LogEntryVersion::CURRENT {
        ch.put_u8(version.as_byte())?;
    }
    ch.put_u8(entry.type_byte())?;
    ch.put_i32(entry.identifier())?;
    match entry {
        LogEntry::Start(start) => {
            start.xid.write_to(ch)?;
            ch.put_i32(start.master_id)?;
            ch.put_i32(start.author_id)?;
            ch.put_i64(start.time_written)?;
            ch.put_i64(start.last_committed_tx_when_started as i64)?;
            if version >= LogEntryVersion::V2 {
                put_len(ch, start.additional_header.len())?;
                ch.put_bytes(&start.additional_header)?;
            } else if !start.additional_header.is_empty() {
                return Err(CodecError::invalid_structure(
                    "V1 start entries cannot carry an additional header",
                ));
            }
            Ok(())
        }
        LogEntry::Prepare { time_written, .. } => ch.put_i64(*time_written),
        LogEntry::OnePhaseCommit(commit) | LogEntry::TwoPhaseCommit(commit) => {
            ch.put_i64(commit.tx_id as i64)?;
            ch.put_i64(commit.time_written)
        }
        LogEntry::Done { .. } => Ok(()),
        LogEntry::Command { command, .. } => command.write_to(ch),
    }
}

/// Writes a Command entry in the current format without building a
/// [`LogEntry`] around the command.
///
/// # Errors
///
/// Returns an error if the command cannot be framed or the channel fails.
pub fn write_command_entry<C: WritableChannel + ?Sized>(
    ch: &mut C,
    identifier: i32,
    command: &Command,
) -> CodecResult<()> {
    ch.put_u8(entry_type::COMMAND)?;
    ch.put_i32(identifier)?;
    command.write_to(ch)
}

/// Reads the next entry.
///
/// Returns `Ok(None)` at the end of the entries, which is either a zero
/// type byte or the channel running out of bytes, even halfway through an
/// entry. A caller that needs to know where the last complete entry ended
/// takes the channel position before each call.
///
/// # Errors
///
/// Returns an error for unknown type or version bytes, malformed fields and
/// storage failures.
pub fn read_log_entry<C>(ch: &mut C) -> CodecResult<Option<VersionedLogEntry>>
where
    C: ReadableChannel + PositionAware + ?Sized,
{
    match read_entry_inner(ch) {
        Ok(entry) => Ok(entry),
        Err(e) if e.is_read_past_end() => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_entry_inner<C>(ch: &mut C) -> CodecResult<Option<VersionedLogEntry>>
where
    C: ReadableChannel + PositionAware + ?Sized,
{
    let start_position = ch.current_position();
    let mut type_byte = ch.get_u8()?;
    let mut version = LogEntryVersion::CURRENT;
    if type_byte & 0x80 != 0 {
        version = LogEntryVersion::from_byte(type_byte)?;
        type_byte = ch.get_u8()?;
    }

    let entry = match type_byte {
        entry_type::EMPTY => return Ok(None),
        entry_type::TX_START => {
            let identifier = ch.get_i32()?;
            let xid = Xid::read_from(ch)?;
            let master_id = ch.get_i32()?;
            let author_id = ch.get_i32()?;
            let time_written = ch.get_i64()?;
            let last_committed_tx_when_started = ch.get_i64()? as u64;
            let additional_header = if version >= LogEntryVersion::V2 {
                let len = get_len(ch)?;
                ch.get_vec(len)?
            } else {
                Vec::new()
            };
            LogEntry::Start(StartEntry {
                identifier,
                xid,
                master_id,
                author_id,
                start_position,
                time_written,
                last_committed_tx_when_started,
                additional_header,
            })
        }
        entry_type::TX_PREPARE => LogEntry::Prepare {
            identifier: ch.get_i32()?,
            time_written: ch.get_i64()?,
        },
        entry_type::TX_1P_COMMIT => LogEntry::OnePhaseCommit(read_commit(ch)?),
        entry_type::TX_2P_COMMIT => LogEntry::TwoPhaseCommit(read_commit(ch)?),
        entry_type::DONE => LogEntry::Done {
            identifier: ch.get_i32()?,
        },
        entry_type::COMMAND => {
            let identifier = ch.get_i32()?;
            let command = Command::read_from(ch)?;
            LogEntry::Command {
                identifier,
                command,
            }
        }
        other => return Err(CodecError::UnknownEntryType { type_byte: other }),
    };
    Ok(Some(VersionedLogEntry { version, entry }))
}

fn read_commit<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<CommitEntry> {
    Ok(CommitEntry {
        identifier: ch.get_i32()?,
        tx_id: ch.get_i64()? as u64,
        time_written: ch.get_i64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{NeoStoreCommand, NodeCommand};
    use crate::memory::InMemoryLogChannel;
    use proptest::prelude::*;

    fn start(identifier: i32) -> StartEntry {
        StartEntry {
            identifier,
            xid: Xid::new(0x4E45, b"global".to_vec(), b"branch".to_vec()),
            master_id: -1,
            author_id: 2,
            start_position: LogPosition::new(0, 0),
            time_written: 1_700_000_000_000,
            last_committed_tx_when_started: 41,
            additional_header: vec![9, 8, 7],
        }
    }

    fn roundtrip(version: LogEntryVersion, entry: &LogEntry) -> VersionedLogEntry {
        let mut channel = InMemoryLogChannel::new();
        write_versioned_log_entry(&mut channel, version, entry).unwrap();
        let decoded = read_log_entry(&mut channel).unwrap().unwrap();
        assert_eq!(channel.remaining(), 0);
        decoded
    }

    #[test]
    fn current_version_has_no_prefix() {
        let mut channel = InMemoryLogChannel::new();
        write_log_entry(&mut channel, &LogEntry::Done { identifier: 3 }).unwrap();
        assert_eq!(channel.as_bytes(), &[entry_type::DONE, 0, 0, 0, 3]);
    }

    #[test]
    fn older_version_is_prefixed() {
        let mut channel = InMemoryLogChannel::new();
        write_versioned_log_entry(&mut channel, LogEntryVersion::V1, &LogEntry::Done { identifier: 3 })
            .unwrap();
        assert_eq!(channel.as_bytes()[0], 0xFF);

        let decoded = read_log_entry(&mut channel).unwrap().unwrap();
        assert_eq!(decoded.version, LogEntryVersion::V1);
        assert_eq!(decoded.entry, LogEntry::Done { identifier: 3 });
    }

    #[test]
    fn roundtrip_every_variant() {
        let entries = vec![
            LogEntry::Start(start(1)),
            LogEntry::Prepare {
                identifier: 1,
                time_written: 5,
            },
            LogEntry::OnePhaseCommit(CommitEntry {
                identifier: 1,
                tx_id: 77,
                time_written: 6,
            }),
            LogEntry::TwoPhaseCommit(CommitEntry {
                identifier: 1,
                tx_id: 78,
                time_written: 7,
            }),
            LogEntry::Done { identifier: 1 },
            LogEntry::Command {
                identifier: 1,
                command: Command::NeoStore(NeoStoreCommand { next_prop: 3 }),
            },
        ];
        for entry in &entries {
            let decoded = roundtrip(LogEntryVersion::V2, entry);
            assert_eq!(&decoded.entry, entry);
            assert_eq!(decoded.version, LogEntryVersion::V2);
        }
    }

    #[test]
    fn v1_start_drops_additional_header() {
        let mut entry = start(4);
        entry.additional_header.clear();
        let decoded = roundtrip(LogEntryVersion::V1, &LogEntry::Start(entry.clone()));
        assert_eq!(decoded.entry, LogEntry::Start(entry));

        let mut channel = InMemoryLogChannel::new();
        let rejected = write_versioned_log_entry(&mut channel, LogEntryVersion::V1, &LogEntry::Start(start(4)));
        assert!(rejected.is_err());
    }

    #[test]
    fn start_position_is_where_the_entry_was_read() {
        let mut channel = InMemoryLogChannel::with_log_version(2);
        write_log_entry(&mut channel, &LogEntry::Done { identifier: 1 }).unwrap();
        write_log_entry(&mut channel, &LogEntry::Start(start(2))).unwrap();

        read_log_entry(&mut channel).unwrap().unwrap();
        let decoded = read_log_entry(&mut channel).unwrap().unwrap();
        match decoded.entry {
            LogEntry::Start(s) => assert_eq!(s.start_position, LogPosition::new(2, 5)),
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn truncated_entry_reads_as_end() {
        let mut full = InMemoryLogChannel::new();
        write_log_entry(
            &mut full,
            &LogEntry::Command {
                identifier: 9,
                command: Command::Node(NodeCommand {
                    id: 1,
                    before: None,
                    after: None,
                }),
            },
        )
        .unwrap();
        let bytes = full.as_bytes();

        for cut in 0..bytes.len() {
            let mut channel = InMemoryLogChannel::from_bytes(&bytes[..cut]);
            assert!(read_log_entry(&mut channel).unwrap().is_none());
        }
    }

    #[test]
    fn command_entry_matches_generic_framing() {
        let command = Command::NeoStore(NeoStoreCommand { next_prop: 12 });
        let mut direct = InMemoryLogChannel::new();
        write_command_entry(&mut direct, 5, &command).unwrap();

        let mut generic = InMemoryLogChannel::new();
        write_log_entry(
            &mut generic,
            &LogEntry::Command {
                identifier: 5,
                command,
            },
        )
        .unwrap();
        assert_eq!(direct.as_bytes(), generic.as_bytes());
    }

    #[test]
    fn zero_type_byte_ends_entries() {
        let mut channel = InMemoryLogChannel::from_bytes(&[0, 0, 0, 0]);
        assert!(read_log_entry(&mut channel).unwrap().is_none());
    }

    #[test]
    fn unknown_entry_type_is_an_error() {
        let mut channel = InMemoryLogChannel::from_bytes(&[42, 0, 0, 0, 1]);
        let err = read_log_entry(&mut channel).unwrap_err();
        assert!(matches!(err, CodecError::UnknownEntryType { type_byte: 42 }));
    }

    #[test]
    fn unknown_version_byte_is_an_error() {
        let mut channel = InMemoryLogChannel::from_bytes(&[0x90, entry_type::DONE, 0, 0, 0, 1]);
        let err = read_log_entry(&mut channel).unwrap_err();
        assert!(matches!(err, CodecError::UnknownEntryVersion { .. }));
    }

    #[test]
    fn checksum_depends_on_xid_and_origin() {
        let a = start(1);
        let mut b = start(2);
        assert_eq!(a.checksum(), b.checksum());
        b.author_id = 3;
        assert_ne!(a.checksum(), b.checksum());
        let mut c = start(1);
        c.xid.branch_id = b"other".to_vec();
        assert_ne!(a.checksum(), c.checksum());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn garbage_input_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut channel = InMemoryLogChannel::from_bytes(&bytes);
            let mut remaining = channel.remaining();
            while let Ok(Some(_)) = read_log_entry(&mut channel) {
                prop_assert!(channel.remaining() < remaining);
                remaining = channel.remaining();
            }
        }
    }
}
