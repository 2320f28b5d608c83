//! Retention of rotated log files.
//!
//! Each strategy is a threshold that accumulates over log versions scanned
//! from newest to oldest. The first version at which the threshold is
//! reached becomes the lower bound of what is kept; every older version is
//! deleted, lowest first, so a crash halfway never leaves a gap above the
//! remaining files.

use crate::error::{CoreError, CoreResult};
use crate::log::files::LogFiles;
use crate::types::current_time_millis;
use std::time::Duration;
use tracing::info;

/// What the log knows about the contents of each version.
pub trait LogFileInformation {
    /// Returns the id of the first transaction committed in `version`, if
    /// the version exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the version's header cannot be read.
    fn first_committed_tx(&self, version: u64) -> CoreResult<Option<u64>>;

    /// Returns when the first transaction in `version` started, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be scanned.
    fn first_start_time(&self, version: u64) -> CoreResult<Option<i64>>;

    /// Returns the id of the last transaction written to the log.
    fn last_committed_tx(&self) -> u64;
}

/// Which rotated log files to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPruneStrategy {
    /// Never delete anything.
    KeepAll,
    /// Delete every version but the current one.
    KeepNone,
    /// Keep this many versions besides the current one.
    Files(u64),
    /// Keep versions until their total size reaches this many bytes.
    TotalSize(u64),
    /// Keep versions until they hold this many transactions.
    TransactionCount(u64),
    /// Keep versions whose first transaction started within this span.
    TimeSpan(Duration),
}

impl LogPruneStrategy {
    /// Parses a retention setting.
    ///
    /// Accepts `true` (keep all), `false` (keep none), `<n> files`,
    /// `<n>[k|m|g] size`, `<n>[k|m|g] txs`, `<n> hours` and `<n> days`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for anything else.
    pub fn from_config_value(value: &str) -> CoreResult<Self> {
        let value = value.trim();
        match value {
            "true" => return Ok(Self::KeepAll),
            "false" => return Ok(Self::KeepNone),
            _ => {}
        }

        let invalid = || CoreError::invalid_operation(format!("invalid log retention '{value}'"));
        let mut parts = value.split_whitespace();
        let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };

        let (digits, multiplier) = match amount.chars().last().map(|c| c.to_ascii_lowercase()) {
            Some('k') => (&amount[..amount.len() - 1], 1_000),
            Some('m') => (&amount[..amount.len() - 1], 1_000_000),
            Some('g') => (&amount[..amount.len() - 1], 1_000_000_000),
            _ => (amount, 1),
        };
        let number: u64 = digits.parse().map_err(|_| invalid())?;
        let scaled = number.checked_mul(multiplier).ok_or_else(invalid)?;

        match unit.to_ascii_lowercase().as_str() {
            "files" if multiplier == 1 => Ok(Self::Files(scaled)),
            "size" => Ok(Self::TotalSize(scaled)),
            "txs" => Ok(Self::TransactionCount(scaled)),
            "hours" if multiplier == 1 => Ok(Self::TimeSpan(Duration::from_secs(number * 3_600))),
            "days" if multiplier == 1 => Ok(Self::TimeSpan(Duration::from_secs(number * 86_400))),
            _ => Err(invalid()),
        }
    }

    /// Deletes the versions this strategy no longer keeps, given that
    /// `current_version` is being written.
    ///
    /// Returns the deleted versions, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be inspected or deleted.
    pub fn prune(
        &self,
        current_version: u64,
        files: &LogFiles,
        info: &dyn LogFileInformation,
    ) -> CoreResult<Vec<u64>> {
        if matches!(self, Self::KeepAll) || current_version == 0 {
            return Ok(Vec::new());
        }

        let existing: Vec<u64> = files
            .versions()?
            .into_iter()
            .filter(|&v| v < current_version)
            .collect();

        // Walk down from the newest rotated version while versions are
        // contiguous, stopping where the threshold is reached.
        let mut threshold = Threshold::default();
        let mut upper = None;
        let mut expected = current_version;
        for &version in existing.iter().rev() {
            if version + 1 != expected {
                break;
            }
            expected = version;
            if self.reached(&mut threshold, version, files, info)? {
                upper = Some(version);
                break;
            }
        }
        let Some(upper) = upper else {
            return Ok(Vec::new());
        };

        let doomed: Vec<u64> = existing.into_iter().filter(|&v| v < upper).collect();
        for &version in &doomed {
            files.delete(version)?;
            info!(version, "pruned log version");
        }
        Ok(doomed)
    }

    fn reached(
        &self,
        threshold: &mut Threshold,
        version: u64,
        files: &LogFiles,
        info: &dyn LogFileInformation,
    ) -> CoreResult<bool> {
        Ok(match *self {
            Self::KeepAll => false,
            Self::KeepNone => true,
            Self::Files(max) => {
                threshold.files += 1;
                threshold.files >= max
            }
            Self::TotalSize(max) => {
                threshold.bytes += files.size(version)?;
                threshold.bytes >= max
            }
            Self::TransactionCount(max) => match info.first_committed_tx(version)? {
                Some(first) => info.last_committed_tx().saturating_sub(first) >= max,
                None => false,
            },
            Self::TimeSpan(span) => match info.first_start_time(version)? {
                Some(started) => {
                    let span_millis = i64::try_from(span.as_millis()).unwrap_or(i64::MAX);
                    started < current_time_millis().saturating_sub(span_millis)
                }
                None => false,
            },
        })
    }
}

#[derive(Debug, Default)]
struct Threshold {
    files: u64,
    bytes: u64,
}
