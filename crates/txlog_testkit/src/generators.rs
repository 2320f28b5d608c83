//! Property-based test generators using proptest.
//!
//! Provides strategies for log entries, commands and transactions whose
//! fields stay within what the codec can frame.

use proptest::prelude::*;
use txlog_codec::{
    Command, CommitEntry, DynamicRecord, IndexEntityType, LegacyIndexAction, LegacyIndexCommand,
    LogEntry, LogEntryVersion, LogPosition, NeoStoreCommand, NodeCommand, NodeRecord,
    PropertyBlock, PropertyCommand, PropertyOwner, PropertyRecord, RelationshipCommand,
    RelationshipGroupCommand, RelationshipGroupRecord, RelationshipRecord, SchemaRuleCommand,
    StartEntry, TokenCommand, TokenRecord, VersionedLogEntry, Xid, MAX_XID_PART,
};
use txlog_core::TransactionRepresentation;

/// Strategy for generating xids.
pub fn arb_xid() -> impl Strategy<Value = Xid> {
    (
        any::<i32>(),
        prop::collection::vec(any::<u8>(), 0..=MAX_XID_PART),
        prop::collection::vec(any::<u8>(), 0..=MAX_XID_PART),
    )
        .prop_map(|(format_id, global_id, branch_id)| Xid::new(format_id, global_id, branch_id))
}

fn arb_bytes(max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..max)
}

fn arb_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("\\PC{0,16}").expect("Invalid regex")
}

fn arb_node_record() -> impl Strategy<Value = NodeRecord> {
    (any::<bool>(), any::<i64>(), any::<i64>(), any::<i64>()).prop_map(
        |(dense, next_rel, next_prop, labels)| NodeRecord {
            dense,
            next_rel,
            next_prop,
            labels,
        },
    )
}

fn arb_relationship_record() -> impl Strategy<Value = RelationshipRecord> {
    (
        any::<bool>(),
        any::<i64>(),
        any::<i64>(),
        any::<i32>(),
        any::<[i64; 5]>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(created, first_node, second_node, rel_type, chain, first_in_first, first_in_second)| {
                RelationshipRecord {
                    created,
                    first_node,
                    second_node,
                    rel_type,
                    first_prev_rel: chain[0],
                    first_next_rel: chain[1],
                    second_prev_rel: chain[2],
                    second_next_rel: chain[3],
                    next_prop: chain[4],
                    first_in_first_chain: first_in_first,
                    first_in_second_chain: first_in_second,
                }
            },
        )
}

fn arb_property_record() -> impl Strategy<Value = PropertyRecord> {
    let owner = prop_oneof![
        Just(PropertyOwner::Unknown),
        any::<u64>().prop_map(PropertyOwner::Node),
        any::<u64>().prop_map(PropertyOwner::Relationship),
    ];
    let block = (any::<i32>(), arb_bytes(32)).prop_map(|(key_id, value)| PropertyBlock { key_id, value });
    (owner, any::<i64>(), any::<i64>(), prop::collection::vec(block, 0..4)).prop_map(
        |(owner, prev_prop, next_prop, blocks)| PropertyRecord {
            owner,
            prev_prop,
            next_prop,
            blocks,
        },
    )
}

fn arb_dynamic_records() -> impl Strategy<Value = Vec<DynamicRecord>> {
    let record = (any::<u64>(), prop::option::of(arb_bytes(48)))
        .prop_map(|(id, data)| DynamicRecord { id, data });
    prop::collection::vec(record, 0..4)
}

fn arb_token() -> impl Strategy<Value = TokenCommand> {
    let record = (any::<i32>(), arb_dynamic_records()).prop_map(|(name_id, name_records)| TokenRecord {
        name_id,
        name_records,
    });
    (any::<i32>(), prop::option::of(record)).prop_map(|(id, record)| TokenCommand { id, record })
}

fn arb_legacy_index() -> impl Strategy<Value = LegacyIndexCommand> {
    let entity_type = prop_oneof![Just(IndexEntityType::Node), Just(IndexEntityType::Relationship)];
    let action = prop_oneof![
        (any::<u64>(), arb_name(), arb_bytes(32))
            .prop_map(|(entity_id, key, value)| LegacyIndexAction::Add { entity_id, key, value }),
        (any::<u64>(), prop::option::of(arb_name()))
            .prop_map(|(entity_id, key)| LegacyIndexAction::Remove { entity_id, key }),
        Just(LegacyIndexAction::Delete),
        prop::collection::vec((arb_name(), arb_name()), 0..3)
            .prop_map(|config| LegacyIndexAction::Create { config }),
    ];
    (arb_name(), entity_type, action).prop_map(|(index_name, entity_type, action)| {
        LegacyIndexCommand {
            index_name,
            entity_type,
            action,
        }
    })
}

/// Strategy for generating store commands of every kind.
pub fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        3 => (any::<u64>(), prop::option::of(arb_node_record()), prop::option::of(arb_node_record()))
            .prop_map(|(id, before, after)| Command::Node(NodeCommand { id, before, after })),
        2 => (any::<u64>(), prop::option::of(arb_relationship_record()))
            .prop_map(|(id, record)| Command::Relationship(RelationshipCommand { id, record })),
        2 => (any::<u64>(), prop::option::of(arb_property_record()), prop::option::of(arb_property_record()))
            .prop_map(|(id, before, after)| Command::Property(PropertyCommand { id, before, after })),
        1 => (any::<u64>(), prop::option::of(any::<(i16, [i64; 5])>()))
            .prop_map(|(id, record)| Command::RelationshipGroup(RelationshipGroupCommand {
                id,
                record: record.map(|(rel_type, g)| RelationshipGroupRecord {
                    rel_type,
                    next: g[0],
                    first_out: g[1],
                    first_in: g[2],
                    first_loop: g[3],
                    owning_node: g[4],
                }),
            })),
        1 => arb_token().prop_map(Command::RelationshipTypeToken),
        1 => arb_token().prop_map(Command::LabelToken),
        1 => arb_token().prop_map(Command::PropertyKeyToken),
        1 => (any::<u64>(), arb_dynamic_records(), arb_dynamic_records())
            .prop_map(|(rule_id, before, after)| Command::SchemaRule(SchemaRuleCommand { rule_id, before, after })),
        1 => any::<i64>().prop_map(|next_prop| Command::NeoStore(NeoStoreCommand { next_prop })),
        1 => arb_legacy_index().prop_map(Command::LegacyIndex),
    ]
}

fn arb_start(with_header: bool) -> impl Strategy<Value = StartEntry> {
    let header = if with_header { 0..64usize } else { 0..1usize };
    (
        any::<i32>(),
        arb_xid(),
        any::<i32>(),
        any::<i32>(),
        any::<i64>(),
        any::<u64>(),
        prop::collection::vec(any::<u8>(), header),
    )
        .prop_map(
            move |(identifier, xid, master_id, author_id, time_written, last_committed, header)| {
                StartEntry {
                    identifier,
                    xid,
                    master_id,
                    author_id,
                    start_position: LogPosition::new(0, 0),
                    time_written,
                    last_committed_tx_when_started: last_committed,
                    additional_header: if with_header { header } else { Vec::new() },
                }
            },
        )
}

fn arb_commit() -> impl Strategy<Value = CommitEntry> {
    (any::<i32>(), any::<u64>(), any::<i64>()).prop_map(|(identifier, tx_id, time_written)| {
        CommitEntry {
            identifier,
            tx_id,
            time_written,
        }
    })
}

fn arb_entry(with_header: bool) -> impl Strategy<Value = LogEntry> {
    prop_oneof![
        arb_start(with_header).prop_map(LogEntry::Start),
        (any::<i32>(), any::<i64>())
            .prop_map(|(identifier, time_written)| LogEntry::Prepare { identifier, time_written }),
        arb_commit().prop_map(LogEntry::OnePhaseCommit),
        arb_commit().prop_map(LogEntry::TwoPhaseCommit),
        any::<i32>().prop_map(|identifier| LogEntry::Done { identifier }),
        (any::<i32>(), arb_command())
            .prop_map(|(identifier, command)| LogEntry::Command { identifier, command }),
    ]
}

/// Strategy for generating log entries in the current format.
///
/// Start entries are positioned at the start of version 0; a caller
/// writing several entries fixes the positions up.
pub fn arb_log_entry() -> impl Strategy<Value = LogEntry> {
    arb_entry(true)
}

/// Strategy for generating log entries in any supported format.
pub fn arb_versioned_log_entry() -> impl Strategy<Value = VersionedLogEntry> {
    prop_oneof![
        arb_entry(false).prop_map(|entry| VersionedLogEntry {
            version: LogEntryVersion::V1,
            entry,
        }),
        arb_entry(true).prop_map(|entry| VersionedLogEntry {
            version: LogEntryVersion::V2,
            entry,
        }),
    ]
}

/// Strategy for generating transactions of up to `max_commands` commands.
pub fn arb_transaction(max_commands: usize) -> impl Strategy<Value = TransactionRepresentation> {
    (
        prop::collection::vec(arb_command(), 0..=max_commands),
        arb_bytes(16),
        any::<i32>(),
        any::<i64>(),
    )
        .prop_map(|(commands, header, author_id, time_started)| {
            TransactionRepresentation::new(commands).with_header(header, -1, author_id, time_started, 0)
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
