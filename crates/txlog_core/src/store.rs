//! Collaborators the log consults instead of assuming store state.
//!
//! The log never decides on its own which transaction id comes next, how far
//! the store has committed, or which log version is current. It asks the
//! collaborators defined here:
//!
//! - [`TransactionIdGenerator`] - hands out durable transaction ids
//! - [`StoreDurability`] - flushes the store and tracks versions and closes
//! - [`TransactionApplier`] - applies committed commands to the store
//!
//! [`TransactionIdStore`] is an in-memory implementation of the first two,
//! enough to run the log standalone and in tests.

use crate::error::{CoreError, CoreResult};
use crate::transaction::TransactionRepresentation;
use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hands out durable transaction ids.
pub trait TransactionIdGenerator: Send + Sync + Debug {
    /// Returns the id for a transaction about to be committed.
    ///
    /// Called with the log writer held, so ids reach the log in the order
    /// they are generated.
    ///
    /// # Errors
    ///
    /// Returns an error if no id can be handed out.
    fn generate(&self, transaction: &TransactionRepresentation) -> CoreResult<TransactionId>;

    /// Reports that `tx_id` is durably in the log.
    ///
    /// `external_author` is set when the transaction was authored elsewhere
    /// and shipped here.
    fn committed(
        &self,
        data_source: &str,
        identifier: i32,
        tx_id: TransactionId,
        external_author: Option<i32>,
    );

    /// Takes back `tx_id`, generated for a transaction that never reached
    /// the log, so the next transaction gets it instead.
    ///
    /// Called with the log writer still held, right after the failed write.
    fn released(&self, tx_id: TransactionId);
}

/// Store-side durability hooks.
pub trait StoreDurability: Send + Sync + Debug {
    /// Forces everything the store holds to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be flushed.
    fn flush_all(&self) -> CoreResult<()>;

    /// Returns the id of the last transaction committed to the store.
    fn last_committed_tx(&self) -> TransactionId;

    /// Returns the log version the store currently writes to.
    fn current_log_version(&self) -> u64;

    /// Moves the store to the next log version and returns the previous one.
    fn get_and_set_new_log_version(&self) -> u64;

    /// Blocks until every transaction that has been handed an id is closed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RotationTimeout`] if `timeout` elapses first.
    fn await_all_transactions_closed(&self, timeout: Option<Duration>) -> CoreResult<()>;

    /// Reports that `tx_id` has been applied and is no longer open.
    fn transaction_closed(&self, tx_id: TransactionId);
}

/// Why a transaction is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Committed on this instance.
    Internal,
    /// Shipped from another instance.
    External,
    /// Re-committed during recovery; parts may already be applied.
    Recovery,
}

/// Applies committed commands to the store.
pub trait TransactionApplier: Send + Sync + Debug {
    /// Applies a committed transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the transaction.
    fn apply(
        &self,
        tx_id: TransactionId,
        transaction: &TransactionRepresentation,
        mode: ApplyMode,
    ) -> CoreResult<()>;
}

/// The store-side collaborators, bundled for wiring.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Transaction id source.
    pub generator: Arc<dyn TransactionIdGenerator>,
    /// Store durability hooks.
    pub durability: Arc<dyn StoreDurability>,
    /// Store applier.
    pub applier: Arc<dyn TransactionApplier>,
}

impl Collaborators {
    /// Uses `store` as both the id generator and the durability hooks.
    pub fn with_id_store(store: Arc<TransactionIdStore>, applier: Arc<dyn TransactionApplier>) -> Self {
        Self {
            generator: store.clone(),
            durability: store,
            applier,
        }
    }
}

/// Tracks the highest id below which every id has been seen.
#[derive(Debug, Default)]
struct GapFreeCounter {
    value: u64,
    ahead: BTreeSet<u64>,
}

impl GapFreeCounter {
    fn new(value: u64) -> Self {
        Self {
            value,
            ahead: BTreeSet::new(),
        }
    }

    fn offer(&mut self, id: u64) {
        if id <= self.value {
            return;
        }
        self.ahead.insert(id);
        while self.ahead.remove(&(self.value + 1)) {
            self.value += 1;
        }
    }
}

#[derive(Debug)]
struct IdState {
    highest_generated: u64,
    committed: GapFreeCounter,
    closed: GapFreeCounter,
    log_version: u64,
    flushes: u64,
}

/// In-memory transaction id generator and store durability hooks.
#[derive(Debug)]
pub struct TransactionIdStore {
    state: Mutex<IdState>,
    closed: Condvar,
}

impl TransactionIdStore {
    /// Creates a store that has committed up to `last_committed` and writes
    /// to `log_version`.
    #[must_use]
    pub fn new(last_committed: u64, log_version: u64) -> Self {
        Self {
            state: Mutex::new(IdState {
                highest_generated: last_committed,
                committed: GapFreeCounter::new(last_committed),
                closed: GapFreeCounter::new(last_committed),
                log_version,
                flushes: 0,
            }),
            closed: Condvar::new(),
        }
    }

    /// Returns the highest id below which every transaction is closed.
    #[must_use]
    pub fn last_closed_tx(&self) -> TransactionId {
        TransactionId::new(self.state.lock().closed.value)
    }

    /// Returns how many times the store was flushed.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }
}

impl Default for TransactionIdStore {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl TransactionIdGenerator for TransactionIdStore {
    fn generate(&self, _transaction: &TransactionRepresentation) -> CoreResult<TransactionId> {
        let mut state = self.state.lock();
        state.highest_generated += 1;
        Ok(TransactionId::new(state.highest_generated))
    }

    fn committed(
        &self,
        _data_source: &str,
        _identifier: i32,
        tx_id: TransactionId,
        _external_author: Option<i32>,
    ) {
        let mut state = self.state.lock();
        state.highest_generated = state.highest_generated.max(tx_id.as_u64());
        state.committed.offer(tx_id.as_u64());
    }

    fn released(&self, tx_id: TransactionId) {
        let mut state = self.state.lock();
        if state.highest_generated == tx_id.as_u64() {
            state.highest_generated -= 1;
        }
    }
}

impl StoreDurability for TransactionIdStore {
    fn flush_all(&self) -> CoreResult<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    fn last_committed_tx(&self) -> TransactionId {
        TransactionId::new(self.state.lock().committed.value)
    }

    fn current_log_version(&self) -> u64 {
        self.state.lock().log_version
    }

    fn get_and_set_new_log_version(&self) -> u64 {
        let mut state = self.state.lock();
        let previous = state.log_version;
        state.log_version += 1;
        previous
    }

    fn await_all_transactions_closed(&self, timeout: Option<Duration>) -> CoreResult<()> {
        let started = Instant::now();
        let mut state = self.state.lock();
        let awaited = state.highest_generated;
        let deadline = timeout.map(|t| started + t);

        while state.closed.value < awaited {
            match deadline {
                Some(deadline) => {
                    if self.closed.wait_until(&mut state, deadline).timed_out()
                        && state.closed.value < awaited
                    {
                        return Err(CoreError::RotationTimeout {
                            waited: started.elapsed(),
                            awaited,
                        });
                    }
                }
                None => self.closed.wait(&mut state),
            }
        }
        Ok(())
    }

    fn transaction_closed(&self, tx_id: TransactionId) {
        let mut state = self.state.lock();
        state.closed.offer(tx_id.as_u64());
        drop(state);
        self.closed.notify_all();
    }
}
