//! Commit ordering for legacy index changes.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// A queue of transaction ids released strictly in the order offered.
///
/// Legacy indexes are not covered by record locks, so transactions that
/// change one line up here and apply their index changes only once their
/// id reaches the head. Ids may be sparse but are always offered in
/// increasing order.
#[derive(Debug, Default)]
pub struct IdOrderingQueue {
    queue: Mutex<VecDeque<u64>>,
    head_changed: Condvar,
}

impl IdOrderingQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an id to the tail.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] if `tx_id` is not greater than
    /// the current tail.
    pub fn offer(&self, tx_id: TransactionId) -> CoreResult<()> {
        let mut queue = self.queue.lock();
        if let Some(&tail) = queue.back() {
            if tx_id.as_u64() <= tail {
                return Err(CoreError::illegal_state(format!(
                    "offered {tx_id} after {}",
                    TransactionId::new(tail)
                )));
            }
        }
        queue.push_back(tx_id.as_u64());
        Ok(())
    }

    /// Blocks until `tx_id` is at the head.
    pub fn await_head(&self, tx_id: TransactionId) {
        let mut queue = self.queue.lock();
        while queue.front() != Some(&tx_id.as_u64()) {
            self.head_changed.wait(&mut queue);
        }
    }

    /// Removes `tx_id` from the head and wakes the waiters.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] if `tx_id` is not the head.
    pub fn remove_head(&self, tx_id: TransactionId) -> CoreResult<()> {
        let mut queue = self.queue.lock();
        match queue.front() {
            Some(&head) if head == tx_id.as_u64() => {
                queue.pop_front();
            }
            head => {
                return Err(CoreError::illegal_state(format!(
                    "removing {tx_id} but head is {head:?}"
                )));
            }
        }
        drop(queue);
        self.head_changed.notify_all();
        Ok(())
    }

    /// Returns whether no ids are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Returns the number of queued ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
