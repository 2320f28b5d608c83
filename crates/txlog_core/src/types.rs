//! Core type definitions for txlog.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use txlog_codec::Xid;
use uuid::Uuid;

/// Durable transaction id.
///
/// Assigned at commit, strictly increasing and gap free. Distinct from the
/// session-scoped identifier that correlates a transaction's log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next transaction ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Xid format id used for xids minted by this crate.
pub const XID_FORMAT_ID: i32 = 0x4E45_4F4B;

/// Wall clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Mints a fresh xid whose branch names the data source.
#[must_use]
pub fn new_xid(data_source: &str) -> Xid {
    let global = Uuid::new_v4();
    let mut branch = data_source.as_bytes().to_vec();
    branch.truncate(txlog_codec::MAX_XID_PART);
    Xid::new(XID_FORMAT_ID, global.as_bytes().to_vec(), branch)
}
