//! Bounded caches of transaction positions and log headers.
//!
//! Both caches are hints. An evicted or stale entry sends the caller back to
//! scanning the log files, never to a wrong answer.

use crate::types::TransactionId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use txlog_codec::LogPosition;

/// Where a committed transaction starts and who wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionMetadata {
    /// Position of the transaction's Start entry.
    pub start_position: LogPosition,
    /// Instance the transaction originated on.
    pub master_id: i32,
    /// Instance that authored the transaction.
    pub author_id: i32,
    /// Checksum of the Start entry.
    pub checksum: u64,
}

/// LRU caches for `tx id -> metadata` and `log version -> previous committed tx`.
pub struct TransactionMetadataCache {
    transactions: Mutex<LruCache<u64, TransactionMetadata>>,
    headers: Mutex<LruCache<u64, u64>>,
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl TransactionMetadataCache {
    /// Creates caches holding up to `tx_cache_size` transactions and
    /// `header_cache_size` headers.
    #[must_use]
    pub fn new(tx_cache_size: usize, header_cache_size: usize) -> Self {
        Self {
            transactions: Mutex::new(LruCache::new(capacity(tx_cache_size))),
            headers: Mutex::new(LruCache::new(capacity(header_cache_size))),
        }
    }

    /// Caches where a transaction starts.
    pub fn cache_transaction(&self, tx_id: TransactionId, metadata: TransactionMetadata) {
        self.transactions.lock().put(tx_id.as_u64(), metadata);
    }

    /// Looks up a cached transaction.
    #[must_use]
    pub fn transaction(&self, tx_id: TransactionId) -> Option<TransactionMetadata> {
        self.transactions.lock().get(&tx_id.as_u64()).copied()
    }

    /// Drops a cached transaction.
    pub fn forget_transaction(&self, tx_id: TransactionId) {
        self.transactions.lock().pop(&tx_id.as_u64());
    }

    /// Caches the previous committed tx id from a log header.
    pub fn cache_header(&self, log_version: u64, prev_committed_tx: u64) {
        self.headers.lock().put(log_version, prev_committed_tx);
    }

    /// Looks up a cached header.
    #[must_use]
    pub fn header(&self, log_version: u64) -> Option<u64> {
        self.headers.lock().get(&log_version).copied()
    }

    /// Drops a cached header, for a pruned log version.
    pub fn forget_header(&self, log_version: u64) {
        self.headers.lock().pop(&log_version);
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.transactions.lock().clear();
        self.headers.lock().clear();
    }
}

impl std::fmt::Debug for TransactionMetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMetadataCache")
            .field("transactions", &self.transactions.lock().len())
            .field("headers", &self.headers.lock().len())
            .finish()
    }
}
