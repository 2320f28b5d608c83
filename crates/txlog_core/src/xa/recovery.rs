//! Recovery of the newest log version after an unclean shutdown.
//!
//! Only the newest version needs scanning: rotation copies every
//! transaction still in flight into the new file, so nothing unresolved
//! lives further back.

use crate::error::{CoreError, CoreResult};
use crate::log::LogFile;
use crate::store::Collaborators;
use crate::types::TransactionId;
use crate::xa::resource_manager::{ResourceManager, Resolution};
use tracing::{info, warn};
use txlog_codec::{read_log_entry, LogPosition, PositionAware};

/// What recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The version that was scanned.
    pub log_version: u64,
    /// Complete entries read.
    pub entries: usize,
    /// Bytes cut from the end of the file after the last complete entry.
    pub truncated_bytes: u64,
    /// The last transaction id in the log.
    pub last_tx_id: u64,
    /// How in-flight transactions were resolved.
    pub resolution: Resolution,
}

/// Replays the newest log version into `rm` and resolves what it finds.
///
/// Running this on a log it has already recovered changes nothing.
///
/// # Errors
///
/// Returns [`CoreError::Recovery`] naming the version and offset of the
/// entry recovery gave up on.
pub(crate) fn recover(
    log: &LogFile,
    rm: &ResourceManager,
    collaborators: &Collaborators,
    data_source: &str,
) -> CoreResult<RecoveryReport> {
    let log_version = log.current_version();
    let from = LogPosition::start_of(log_version);
    info!(log_version, "recovering log");

    let mut reader = log
        .version_reader(from)
        .map_err(|e| CoreError::recovery(log_version, from.byte_offset(), e))?;
    let mut end = from;
    let mut entries = 0;
    loop {
        let position = reader.current_position();
        let entry = read_log_entry(&mut reader)
            .map_err(|e| CoreError::recovery(log_version, position.byte_offset(), e.into()))?;
        let Some(versioned) = entry else {
            break;
        };
        if let Some(commit) = versioned.entry.as_commit() {
            log.writer().observe_tx_id(commit.tx_id);
        }
        log.writer().observe_identifier(versioned.entry.identifier());
        rm.inject(position, versioned.entry)
            .map_err(|e| CoreError::recovery(log_version, position.byte_offset(), e))?;
        end = reader.current_position();
        entries += 1;
    }

    let size = log
        .files()
        .size(log_version)
        .map_err(|e| CoreError::recovery(log_version, end.byte_offset(), e))?;
    let truncated_bytes = size.saturating_sub(end.byte_offset());
    if truncated_bytes > 0 {
        warn!(
            log_version,
            offset = end.byte_offset(),
            bytes = truncated_bytes,
            "truncating torn log tail"
        );
        log.truncate_tail(end)
            .map_err(|e| CoreError::recovery(log_version, end.byte_offset(), e))?;
    }

    let resolution = rm
        .check_xids()
        .map_err(|e| CoreError::recovery(log_version, end.byte_offset(), e))?;
    log.force()
        .map_err(|e| CoreError::recovery(log_version, end.byte_offset(), e))?;

    let last_tx_id = log.last_written_tx_id();
    catch_up(collaborators, data_source, last_tx_id);

    info!(
        log_version,
        entries,
        recommitted = resolution.recommitted.len(),
        rolled_back = resolution.rolled_back,
        in_doubt = resolution.in_doubt.len(),
        "recovery complete"
    );
    Ok(RecoveryReport {
        log_version,
        entries,
        truncated_bytes,
        last_tx_id,
        resolution,
    })
}

/// Tells the store about every transaction the log holds beyond what the
/// store reports as committed.
pub(crate) fn catch_up(collaborators: &Collaborators, data_source: &str, last_tx_id: u64) {
    let store_last = collaborators.durability.last_committed_tx().as_u64();
    if store_last >= last_tx_id {
        return;
    }
    info!(from = store_last + 1, to = last_tx_id, "store behind log, catching up ids");
    for id in store_last + 1..=last_tx_id {
        let tx_id = TransactionId::new(id);
        collaborators.generator.committed(data_source, -1, tx_id, None);
        collaborators.durability.transaction_closed(tx_id);
    }
}
