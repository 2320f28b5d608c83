//! Transactions as the log sees them.

use crate::error::CoreResult;
use crate::types::{current_time_millis, TransactionId};
use txlog_codec::{Command, CommitEntry, StartEntry};

/// An ordered list of store commands plus transaction metadata.
///
/// Command order is whatever the builder produced and is reproduced
/// exactly on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRepresentation {
    commands: Vec<Command>,
    /// Opaque bytes carried in the Start entry for the store.
    pub additional_header: Vec<u8>,
    /// Instance the transaction originated on.
    pub master_id: i32,
    /// Instance that authored the transaction.
    pub author_id: i32,
    /// Wall clock millis when the transaction started.
    pub time_started: i64,
    /// Last committed transaction id when this transaction started.
    pub last_committed_tx_when_started: u64,
}

impl TransactionRepresentation {
    /// Creates a locally authored transaction.
    #[must_use]
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            commands,
            additional_header: Vec::new(),
            master_id: -1,
            author_id: -1,
            time_started: current_time_millis(),
            last_committed_tx_when_started: 0,
        }
    }

    /// Sets the header metadata.
    #[must_use]
    pub fn with_header(
        mut self,
        additional_header: Vec<u8>,
        master_id: i32,
        author_id: i32,
        time_started: i64,
        last_committed_tx_when_started: u64,
    ) -> Self {
        self.additional_header = additional_header;
        self.master_id = master_id;
        self.author_id = author_id;
        self.time_started = time_started;
        self.last_committed_tx_when_started = last_committed_tx_when_started;
        self
    }

    /// Returns the commands in authored order.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Returns the number of commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns whether the transaction has no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Visits every command in order.
    ///
    /// The visitor returns `Ok(false)` to stop early. Returns whether every
    /// command was visited.
    ///
    /// # Errors
    ///
    /// Returns the first error the visitor returns.
    pub fn accept<F>(&self, mut visitor: F) -> CoreResult<bool>
    where
        F: FnMut(&Command) -> CoreResult<bool>,
    {
        for command in &self.commands {
            if !visitor(command)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns whether any command changes a legacy index.
    #[must_use]
    pub fn has_legacy_index_changes(&self) -> bool {
        self.commands.iter().any(Command::is_legacy_index)
    }

    pub(crate) fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Rebuilds a transaction from its logged Start entry and commands.
    pub(crate) fn from_start(start: &StartEntry, commands: Vec<Command>) -> Self {
        Self {
            commands,
            additional_header: start.additional_header.clone(),
            master_id: start.master_id,
            author_id: start.author_id,
            time_started: start.time_written,
            last_committed_tx_when_started: start.last_committed_tx_when_started,
        }
    }
}

/// A committed transaction exactly as the log holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransactionRepresentation {
    /// The Start entry, with the position it was read from.
    pub start: StartEntry,
    /// The commands and metadata.
    pub transaction: TransactionRepresentation,
    /// The commit marker.
    pub commit: CommitEntry,
}

impl CommittedTransactionRepresentation {
    /// Returns the durable transaction id.
    #[must_use]
    pub const fn tx_id(&self) -> TransactionId {
        TransactionId::new(self.commit.tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txlog_codec::{
        IndexEntityType, LegacyIndexAction, LegacyIndexCommand, NeoStoreCommand, NodeCommand,
    };

    fn node(id: u64) -> Command {
        Command::Node(NodeCommand {
            id,
            before: None,
            after: None,
        })
    }

    #[test]
    fn visits_in_authored_order() {
        let tx = TransactionRepresentation::new(vec![node(3), node(1), node(2)]);
        let mut seen = Vec::new();
        let complete = tx
            .accept(|c| {
                if let Command::Node(n) = c {
                    seen.push(n.id);
                }
                Ok(true)
            })
            .unwrap();
        assert!(complete);
        assert_eq!(seen, vec![3, 1, 2]);
    }

    #[test]
    fn visitor_can_stop_early() {
        let tx = TransactionRepresentation::new(vec![node(1), node(2), node(3)]);
        let mut count = 0;
        let complete = tx
            .accept(|_| {
                count += 1;
                Ok(count < 2)
            })
            .unwrap();
        assert!(!complete);
        assert_eq!(count, 2);
    }

    #[test]
    fn legacy_index_detection() {
        let plain = TransactionRepresentation::new(vec![Command::NeoStore(NeoStoreCommand {
            next_prop: 1,
        })]);
        assert!(!plain.has_legacy_index_changes());

        let indexed = TransactionRepresentation::new(vec![
            node(1),
            Command::LegacyIndex(LegacyIndexCommand {
                index_name: "people".into(),
                entity_type: IndexEntityType::Node,
                action: LegacyIndexAction::Delete,
            }),
        ]);
        assert!(indexed.has_legacy_index_changes());
    }
}
