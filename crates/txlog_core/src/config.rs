//! Log configuration.

use crate::log::LogPruneStrategy;
use std::time::Duration;

/// How appended transactions are made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceMode {
    /// Every committer forces the log itself.
    PerCommit,
    /// A background thread forces once for every transaction appended
    /// since its last force; committers wait for their turn.
    Batched {
        /// Upper bound on how long a committer sleeps between checks.
        max_wait: Duration,
    },
}

/// Configuration for opening a transaction log.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the active log file at which it is rotated.
    pub rotate_at_size: u64,

    /// Size of the in-memory write buffer in front of the log file.
    pub write_buffer_size: usize,

    /// Size of the read-ahead buffer used when scanning the log.
    pub read_ahead_size: usize,

    /// Which rotated log files to keep.
    pub prune_strategy: LogPruneStrategy,

    /// Number of transaction positions kept in the metadata cache.
    pub tx_cache_size: usize,

    /// Number of log headers kept in the header cache.
    pub header_cache_size: usize,

    /// How commits are forced to disk.
    pub force_mode: ForceMode,

    /// Whether to reject log files written in any other format.
    pub strict_format_check: bool,

    /// How long rotation waits for open transactions to close.
    /// `None` waits forever.
    pub rotation_quiesce_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rotate_at_size: 25 * 1024 * 1024, // 25 MB
            write_buffer_size: 512 * 1024,    // 512 KB
            read_ahead_size: 64 * 1024,       // 64 KB
            prune_strategy: LogPruneStrategy::KeepAll,
            tx_cache_size: 10_000,
            header_cache_size: 1_000,
            force_mode: ForceMode::PerCommit,
            strict_format_check: false,
            rotation_quiesce_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rotation threshold.
    #[must_use]
    pub const fn rotate_at_size(mut self, size: u64) -> Self {
        self.rotate_at_size = size;
        self
    }

    /// Sets the write buffer size.
    #[must_use]
    pub const fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Sets the read-ahead buffer size.
    #[must_use]
    pub const fn read_ahead_size(mut self, size: usize) -> Self {
        self.read_ahead_size = size;
        self
    }

    /// Sets the pruning strategy.
    #[must_use]
    pub const fn prune_strategy(mut self, strategy: LogPruneStrategy) -> Self {
        self.prune_strategy = strategy;
        self
    }

    /// Sets the transaction metadata cache size.
    #[must_use]
    pub const fn tx_cache_size(mut self, size: usize) -> Self {
        self.tx_cache_size = size;
        self
    }

    /// Sets the log header cache size.
    #[must_use]
    pub const fn header_cache_size(mut self, size: usize) -> Self {
        self.header_cache_size = size;
        self
    }

    /// Sets the force mode.
    #[must_use]
    pub const fn force_mode(mut self, mode: ForceMode) -> Self {
        self.force_mode = mode;
        self
    }

    /// Sets whether log format checks are strict.
    #[must_use]
    pub const fn strict_format_check(mut self, value: bool) -> Self {
        self.strict_format_check = value;
        self
    }

    /// Sets the rotation quiesce timeout.
    #[must_use]
    pub const fn rotation_quiesce_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.rotation_quiesce_timeout = timeout;
        self
    }
}
