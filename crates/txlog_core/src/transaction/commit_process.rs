//! Append, apply, close.

use crate::error::CoreResult;
use crate::store::{ApplyMode, StoreDurability, TransactionApplier};
use crate::transaction::appender::TransactionAppender;
use crate::transaction::representation::{
    CommittedTransactionRepresentation, TransactionRepresentation,
};
use crate::types::TransactionId;
use std::sync::Arc;
use tracing::{debug, warn};

/// Commits transactions: makes them durable in the log, applies them to the
/// store and reports them closed.
#[derive(Debug)]
pub struct TransactionCommitProcess {
    appender: Arc<TransactionAppender>,
    applier: Arc<dyn TransactionApplier>,
    durability: Arc<dyn StoreDurability>,
}

impl TransactionCommitProcess {
    /// Creates a commit process.
    pub fn new(
        appender: Arc<TransactionAppender>,
        applier: Arc<dyn TransactionApplier>,
        durability: Arc<dyn StoreDurability>,
    ) -> Self {
        Self {
            appender,
            applier,
            durability,
        }
    }

    /// Returns the appender.
    #[must_use]
    pub fn appender(&self) -> &Arc<TransactionAppender> {
        &self.appender
    }

    /// Commits a locally built transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::TransactionAppendFailure`] if the log
    /// write fails, or the applier's error. In the latter case the
    /// transaction is durable and recovery will apply it again.
    pub fn commit(&self, transaction: &TransactionRepresentation) -> CoreResult<TransactionId> {
        let tx_id = self.appender.append(transaction)?;
        self.apply(tx_id, transaction, ApplyMode::Internal)?;
        debug!(%tx_id, "committed");
        Ok(tx_id)
    }

    /// Commits a transaction shipped from another instance.
    ///
    /// Returns `None` if the log already held it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::OutOfOrderApply`] if earlier transactions
    /// are missing, or an append or apply error.
    pub fn apply_committed(
        &self,
        committed: &CommittedTransactionRepresentation,
    ) -> CoreResult<Option<TransactionId>> {
        if !self.appender.append_committed(committed)? {
            debug!(tx_id = %committed.tx_id(), "already in log");
            return Ok(None);
        }
        let tx_id = committed.tx_id();
        self.apply(tx_id, &committed.transaction, ApplyMode::External)?;
        Ok(Some(tx_id))
    }

    fn apply(
        &self,
        tx_id: TransactionId,
        transaction: &TransactionRepresentation,
        mode: ApplyMode,
    ) -> CoreResult<()> {
        let applied = self.applier.apply(tx_id, transaction, mode);

        // The queue head must move on even if applying failed, or every
        // later legacy index transaction would wait forever.
        if mode == ApplyMode::Internal && transaction.has_legacy_index_changes() {
            if let Err(e) = self.appender.legacy_index_order().remove_head(tx_id) {
                warn!(%tx_id, error = %e, "legacy index ordering out of step");
            }
        }

        match applied {
            Ok(()) => {
                self.durability.transaction_closed(tx_id);
                Ok(())
            }
            Err(e) => {
                warn!(%tx_id, error = %e, "applying committed transaction failed");
                Err(e)
            }
        }
    }
}
