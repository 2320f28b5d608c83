//! Store mutation commands.
//!
//! A command is the payload of a `COMMAND` log entry. It starts with a
//! command type byte followed by a record-kind specific layout. Records that
//! are not in use are encoded as a single zero flag byte, which is why the
//! record images below are `Option`s: `None` means "not in use".
//!
//! ```text
//! | command type (1) | id | record image(s) |
//! ```
//!
//! A zero command type byte is padding and is skipped by the reader.

use crate::channel::{ReadableChannel, WritableChannel};
use crate::error::{CodecError, CodecResult};

/// Upper bound on any length prefix read back from a log.
///
/// Anything larger is treated as corruption instead of an allocation request.
pub const MAX_FIELD_LENGTH: usize = 64 * 1024 * 1024;

/// Command type bytes.
pub mod command_type {
    /// Padding, skipped on read.
    pub const NONE: u8 = 0;
    /// Node record change.
    pub const NODE: u8 = 1;
    /// Property record change.
    pub const PROPERTY: u8 = 2;
    /// Relationship record change.
    pub const RELATIONSHIP: u8 = 3;
    /// Relationship type token change.
    pub const RELATIONSHIP_TYPE_TOKEN: u8 = 4;
    /// Property key token change.
    pub const PROPERTY_KEY_TOKEN: u8 = 5;
    /// Store-wide metadata change.
    pub const NEOSTORE: u8 = 6;
    /// Schema rule change.
    pub const SCHEMA_RULE: u8 = 7;
    /// Label token change.
    pub const LABEL_TOKEN: u8 = 8;
    /// Relationship group record change.
    pub const RELATIONSHIP_GROUP: u8 = 9;
    /// Legacy index change.
    pub const LEGACY_INDEX: u8 = 10;
}

const IN_USE: u8 = 0x1;
const CREATED_IN_TX: u8 = 0x2;

/// A node record image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Whether the node has a relationship group chain instead of a plain chain.
    pub dense: bool,
    /// First relationship (or group, when dense).
    pub next_rel: i64,
    /// First property record.
    pub next_prop: i64,
    /// Inlined labels or a pointer to a dynamic label record.
    pub labels: i64,
}

/// Before and after images of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCommand {
    /// Node id.
    pub id: u64,
    /// Image before the transaction, `None` if the node did not exist.
    pub before: Option<NodeRecord>,
    /// Image after the transaction, `None` if the node was deleted.
    pub after: Option<NodeRecord>,
}

/// A relationship record image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipRecord {
    /// Set when the record was created by this transaction.
    pub created: bool,
    /// Start node.
    pub first_node: i64,
    /// End node.
    pub second_node: i64,
    /// Relationship type token id.
    pub rel_type: i32,
    /// Previous relationship in the start node's chain.
    pub first_prev_rel: i64,
    /// Next relationship in the start node's chain.
    pub first_next_rel: i64,
    /// Previous relationship in the end node's chain.
    pub second_prev_rel: i64,
    /// Next relationship in the end node's chain.
    pub second_next_rel: i64,
    /// First property record.
    pub next_prop: i64,
    /// Whether this is the first relationship in the start node's chain.
    pub first_in_first_chain: bool,
    /// Whether this is the first relationship in the end node's chain.
    pub first_in_second_chain: bool,
}

/// After image of a relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipCommand {
    /// Relationship id.
    pub id: u64,
    /// Record, `None` if the relationship was deleted.
    pub record: Option<RelationshipRecord>,
}

/// Entity owning a property chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyOwner {
    /// No owner recorded.
    Unknown,
    /// A node.
    Node(u64),
    /// A relationship.
    Relationship(u64),
}

/// One key/value slot of a property record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyBlock {
    /// Property key token id.
    pub key_id: i32,
    /// Encoded value.
    pub value: Vec<u8>,
}

/// A property record image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRecord {
    /// Entity owning this chain.
    pub owner: PropertyOwner,
    /// Previous record in the chain.
    pub prev_prop: i64,
    /// Next record in the chain.
    pub next_prop: i64,
    /// Property slots.
    pub blocks: Vec<PropertyBlock>,
}

/// Before and after images of a property record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyCommand {
    /// Property record id.
    pub id: u64,
    /// Image before the transaction.
    pub before: Option<PropertyRecord>,
    /// Image after the transaction.
    pub after: Option<PropertyRecord>,
}

/// A relationship group record image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipGroupRecord {
    /// Relationship type this group holds.
    pub rel_type: i16,
    /// Next group of the owning node.
    pub next: i64,
    /// First outgoing relationship.
    pub first_out: i64,
    /// First incoming relationship.
    pub first_in: i64,
    /// First loop relationship.
    pub first_loop: i64,
    /// Node owning the group.
    pub owning_node: i64,
}

/// After image of a relationship group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipGroupCommand {
    /// Group id.
    pub id: u64,
    /// Record, `None` if the group was deleted.
    pub record: Option<RelationshipGroupRecord>,
}

/// A block of a dynamic (variable-length) record chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRecord {
    /// Block id.
    pub id: u64,
    /// Block content, `None` if the block was freed.
    pub data: Option<Vec<u8>>,
}

/// A token record image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Id of the first dynamic record holding the name.
    pub name_id: i32,
    /// Dynamic records holding the name.
    pub name_records: Vec<DynamicRecord>,
}

/// After image of a token (label, property key or relationship type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCommand {
    /// Token id.
    pub id: i32,
    /// Record, `None` if the token was removed.
    pub record: Option<TokenRecord>,
}

/// Before and after images of a schema rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRuleCommand {
    /// Rule id.
    pub rule_id: u64,
    /// Dynamic records before the transaction.
    pub before: Vec<DynamicRecord>,
    /// Dynamic records after the transaction.
    pub after: Vec<DynamicRecord>,
}

/// Store-wide metadata change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeoStoreCommand {
    /// First graph property record.
    pub next_prop: i64,
}

/// Kind of entity a legacy index holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEntityType {
    /// Node index.
    Node,
    /// Relationship index.
    Relationship,
}

/// What a legacy index command does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyIndexAction {
    /// Adds an entity under a key/value pair.
    Add {
        /// Indexed entity.
        entity_id: u64,
        /// Index key.
        key: String,
        /// Index value.
        value: Vec<u8>,
    },
    /// Removes an entity, from one key or from all keys.
    Remove {
        /// Indexed entity.
        entity_id: u64,
        /// Key to remove from, `None` for every key.
        key: Option<String>,
    },
    /// Drops the whole index.
    Delete,
    /// Creates the index with the given configuration.
    Create {
        /// Configuration pairs.
        config: Vec<(String, String)>,
    },
}

/// A change to a legacy (non record-locked) index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyIndexCommand {
    /// Index name.
    pub index_name: String,
    /// Entity kind the index holds.
    pub entity_type: IndexEntityType,
    /// The change.
    pub action: LegacyIndexAction,
}

/// A single store mutation, as carried by a `COMMAND` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Node change.
    Node(NodeCommand),
    /// Relationship change.
    Relationship(RelationshipCommand),
    /// Property change.
    Property(PropertyCommand),
    /// Relationship group change.
    RelationshipGroup(RelationshipGroupCommand),
    /// Relationship type token change.
    RelationshipTypeToken(TokenCommand),
    /// Label token change.
    LabelToken(TokenCommand),
    /// Property key token change.
    PropertyKeyToken(TokenCommand),
    /// Schema rule change.
    SchemaRule(SchemaRuleCommand),
    /// Store metadata change.
    NeoStore(NeoStoreCommand),
    /// Legacy index change.
    LegacyIndex(LegacyIndexCommand),
}

impl Command {
    /// Returns the command type byte.
    #[must_use]
    pub const fn type_byte(&self) -> u8 {
        match self {
            Self::Node(_) => command_type::NODE,
            Self::Relationship(_) => command_type::RELATIONSHIP,
            Self::Property(_) => command_type::PROPERTY,
            Self::RelationshipGroup(_) => command_type::RELATIONSHIP_GROUP,
            Self::RelationshipTypeToken(_) => command_type::RELATIONSHIP_TYPE_TOKEN,
            Self::LabelToken(_) => command_type::LABEL_TOKEN,
            Self::PropertyKeyToken(_) => command_type::PROPERTY_KEY_TOKEN,
            Self::SchemaRule(_) => command_type::SCHEMA_RULE,
            Self::NeoStore(_) => command_type::NEOSTORE,
            Self::LegacyIndex(_) => command_type::LEGACY_INDEX,
        }
    }

    /// Returns whether this command changes a legacy index.
    #[must_use]
    pub const fn is_legacy_index(&self) -> bool {
        matches!(self, Self::LegacyIndex(_))
    }

    /// Serializes the command.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is too large to frame or the channel fails.
    pub fn write_to<C: WritableChannel + ?Sized>(&self, ch: &mut C) -> CodecResult<()> {
        ch.put_u8(self.type_byte())?;
        match self {
            Self::Node(cmd) => {
                put_u64(ch, cmd.id)?;
                write_node(ch, cmd.before.as_ref())?;
                write_node(ch, cmd.after.as_ref())
            }
            Self::Relationship(cmd) => {
                put_u64(ch, cmd.id)?;
                write_relationship(ch, cmd.record.as_ref())
            }
            Self::Property(cmd) => {
                put_u64(ch, cmd.id)?;
                write_property(ch, cmd.before.as_ref())?;
                write_property(ch, cmd.after.as_ref())
            }
            Self::RelationshipGroup(cmd) => {
                put_u64(ch, cmd.id)?;
                match &cmd.record {
                    None => ch.put_u8(0),
                    Some(group) => {
                        ch.put_u8(IN_USE)?;
                        ch.put_i16(group.rel_type)?;
                        ch.put_i64(group.next)?;
                        ch.put_i64(group.first_out)?;
                        ch.put_i64(group.first_in)?;
                        ch.put_i64(group.first_loop)?;
                        ch.put_i64(group.owning_node)
                    }
                }
            }
            Self::RelationshipTypeToken(cmd) | Self::LabelToken(cmd) | Self::PropertyKeyToken(cmd) => {
                ch.put_i32(cmd.id)?;
                match &cmd.record {
                    None => ch.put_u8(0),
                    Some(token) => {
                        ch.put_u8(IN_USE)?;
                        ch.put_i32(token.name_id)?;
                        write_dynamic_records(ch, &token.name_records)
                    }
                }
            }
            Self::SchemaRule(cmd) => {
                put_u64(ch, cmd.rule_id)?;
                write_dynamic_records(ch, &cmd.before)?;
                write_dynamic_records(ch, &cmd.after)
            }
            Self::NeoStore(cmd) => ch.put_i64(cmd.next_prop),
            Self::LegacyIndex(cmd) => write_legacy_index(ch, cmd),
        }
    }

    /// Deserializes a command, skipping any leading padding bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownCommandType`] for an unknown type byte,
    /// [`CodecError::ReadPastEnd`] if the channel runs dry.
    pub fn read_from<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<Self> {
        let mut type_byte = ch.get_u8()?;
        while type_byte == command_type::NONE {
            type_byte = ch.get_u8()?;
        }
        let command = match type_byte {
            command_type::NODE => {
                let id = get_u64(ch)?;
                let before = read_node(ch)?;
                let after = read_node(ch)?;
                Self::Node(NodeCommand { id, before, after })
            }
            command_type::RELATIONSHIP => {
                let id = get_u64(ch)?;
                let record = read_relationship(ch)?;
                Self::Relationship(RelationshipCommand { id, record })
            }
            command_type::PROPERTY => {
                let id = get_u64(ch)?;
                let before = read_property(ch)?;
                let after = read_property(ch)?;
                Self::Property(PropertyCommand { id, before, after })
            }
            command_type::RELATIONSHIP_GROUP => {
                let id = get_u64(ch)?;
                let record = if read_in_use(ch)? & IN_USE == 0 {
                    None
                } else {
                    Some(RelationshipGroupRecord {
                        rel_type: ch.get_i16()?,
                        next: ch.get_i64()?,
                        first_out: ch.get_i64()?,
                        first_in: ch.get_i64()?,
                        first_loop: ch.get_i64()?,
                        owning_node: ch.get_i64()?,
                    })
                };
                Self::RelationshipGroup(RelationshipGroupCommand { id, record })
            }
            command_type::RELATIONSHIP_TYPE_TOKEN => Self::RelationshipTypeToken(read_token(ch)?),
            command_type::LABEL_TOKEN => Self::LabelToken(read_token(ch)?),
            command_type::PROPERTY_KEY_TOKEN => Self::PropertyKeyToken(read_token(ch)?),
            command_type::SCHEMA_RULE => {
                let rule_id = get_u64(ch)?;
                let before = read_dynamic_records(ch)?;
                let after = read_dynamic_records(ch)?;
                Self::SchemaRule(SchemaRuleCommand {
                    rule_id,
                    before,
                    after,
                })
            }
            command_type::NEOSTORE => Self::NeoStore(NeoStoreCommand {
                next_prop: ch.get_i64()?,
            }),
            command_type::LEGACY_INDEX => Self::LegacyIndex(read_legacy_index(ch)?),
            other => return Err(CodecError::UnknownCommandType { type_byte: other }),
        };
        Ok(command)
    }
}

fn put_u64<C: WritableChannel + ?Sized>(ch: &mut C, value: u64) -> CodecResult<()> {
    ch.put_i64(value as i64)
}

fn get_u64<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<u64> {
    Ok(ch.get_i64()? as u64)
}

fn put_bool<C: WritableChannel + ?Sized>(ch: &mut C, value: bool) -> CodecResult<()> {
    ch.put_u8(u8::from(value))
}

fn get_bool<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<bool> {
    match ch.get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::invalid_structure(format!(
            "invalid boolean byte {other}"
        ))),
    }
}

fn read_in_use<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<u8> {
    let flags = ch.get_u8()?;
    if flags & !(IN_USE | CREATED_IN_TX) != 0 {
        return Err(CodecError::invalid_structure(format!(
            "invalid record flags {flags:#04x}"
        )));
    }
    Ok(flags)
}

/// Writes a length prefix.
pub(crate) fn put_len<C: WritableChannel + ?Sized>(ch: &mut C, len: usize) -> CodecResult<()> {
    if len > MAX_FIELD_LENGTH {
        return Err(CodecError::invalid_structure(format!(
            "field of {len} bytes exceeds {MAX_FIELD_LENGTH}"
        )));
    }
    ch.put_i32(len as i32)
}

/// Reads a length prefix written by [`put_len`].
pub(crate) fn get_len<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<usize> {
    let len = ch.get_i32()?;
    match usize::try_from(len) {
        Ok(len) if len <= MAX_FIELD_LENGTH => Ok(len),
        _ => Err(CodecError::invalid_structure(format!(
            "invalid length prefix {len}"
        ))),
    }
}

fn put_blob<C: WritableChannel + ?Sized>(ch: &mut C, bytes: &[u8]) -> CodecResult<()> {
    put_len(ch, bytes.len())?;
    ch.put_bytes(bytes)
}

fn get_blob<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<Vec<u8>> {
    let len = get_len(ch)?;
    ch.get_vec(len)
}

fn put_string<C: WritableChannel + ?Sized>(ch: &mut C, value: &str) -> CodecResult<()> {
    put_len(ch, value.encode_utf16().count())?;
    ch.put_chars(value)
}

fn get_string<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<String> {
    let count = get_len(ch)?;
    ch.get_chars(count)
}

fn write_node<C: WritableChannel + ?Sized>(ch: &mut C, record: Option<&NodeRecord>) -> CodecResult<()> {
    let Some(node) = record else {
        return ch.put_u8(0);
    };
    ch.put_u8(IN_USE)?;
    put_bool(ch, node.dense)?;
    ch.put_i64(node.next_rel)?;
    ch.put_i64(node.next_prop)?;
    ch.put_i64(node.labels)
}

fn read_node<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<Option<NodeRecord>> {
    if read_in_use(ch)? & IN_USE == 0 {
        return Ok(None);
    }
    Ok(Some(NodeRecord {
        dense: get_bool(ch)?,
        next_rel: ch.get_i64()?,
        next_prop: ch.get_i64()?,
        labels: ch.get_i64()?,
    }))
}

fn write_relationship<C: WritableChannel + ?Sized>(
    ch: &mut C,
    record: Option<&RelationshipRecord>,
) -> CodecResult<()> {
    let Some(rel) = record else {
        return ch.put_u8(0);
    };
    let flags = if rel.created { IN_USE | CREATED_IN_TX } else { IN_USE };
    ch.put_u8(flags)?;
    ch.put_i64(rel.first_node)?;
    ch.put_i64(rel.second_node)?;
    ch.put_i32(rel.rel_type)?;
    ch.put_i64(rel.first_prev_rel)?;
    ch.put_i64(rel.first_next_rel)?;
    ch.put_i64(rel.second_prev_rel)?;
    ch.put_i64(rel.second_next_rel)?;
    ch.put_i64(rel.next_prop)?;
    let chain_flags =
        u8::from(rel.first_in_first_chain) | (u8::from(rel.first_in_second_chain) << 1);
    ch.put_u8(chain_flags)
}

fn read_relationship<C: ReadableChannel + ?Sized>(
    ch: &mut C,
) -> CodecResult<Option<RelationshipRecord>> {
    let flags = read_in_use(ch)?;
    if flags & IN_USE == 0 {
        return Ok(None);
    }
    let first_node = ch.get_i64()?;
    let second_node = ch.get_i64()?;
    let rel_type = ch.get_i32()?;
    let first_prev_rel = ch.get_i64()?;
    let first_next_rel = ch.get_i64()?;
    let second_prev_rel = ch.get_i64()?;
    let second_next_rel = ch.get_i64()?;
    let next_prop = ch.get_i64()?;
    let chain_flags = ch.get_u8()?;
    if chain_flags & !0b11 != 0 {
        return Err(CodecError::invalid_structure(format!(
            "invalid relationship chain flags {chain_flags:#04x}"
        )));
    }
    Ok(Some(RelationshipRecord {
        created: flags & CREATED_IN_TX != 0,
        first_node,
        second_node,
        rel_type,
        first_prev_rel,
        first_next_rel,
        second_prev_rel,
        second_next_rel,
        next_prop,
        first_in_first_chain: chain_flags & 0b01 != 0,
        first_in_second_chain: chain_flags & 0b10 != 0,
    }))
}

fn write_property<C: WritableChannel + ?Sized>(
    ch: &mut C,
    record: Option<&PropertyRecord>,
) -> CodecResult<()> {
    let Some(prop) = record else {
        return ch.put_u8(0);
    };
    ch.put_u8(IN_USE)?;
    match prop.owner {
        PropertyOwner::Unknown => ch.put_u8(0)?,
        PropertyOwner::Node(id) => {
            ch.put_u8(1)?;
            put_u64(ch, id)?;
        }
        PropertyOwner::Relationship(id) => {
            ch.put_u8(2)?;
            put_u64(ch, id)?;
        }
    }
    ch.put_i64(prop.prev_prop)?;
    ch.put_i64(prop.next_prop)?;
    put_len(ch, prop.blocks.len())?;
    for block in &prop.blocks {
        ch.put_i32(block.key_id)?;
        put_blob(ch, &block.value)?;
    }
    Ok(())
}

fn read_property<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<Option<PropertyRecord>> {
    if read_in_use(ch)? & IN_USE == 0 {
        return Ok(None);
    }
    let owner = match ch.get_u8()? {
        0 => PropertyOwner::Unknown,
        1 => PropertyOwner::Node(get_u64(ch)?),
        2 => PropertyOwner::Relationship(get_u64(ch)?),
        other => {
            return Err(CodecError::invalid_structure(format!(
                "invalid property owner tag {other}"
            )))
        }
    };
    let prev_prop = ch.get_i64()?;
    let next_prop = ch.get_i64()?;
    let count = get_len(ch)?;
    let mut blocks = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let key_id = ch.get_i32()?;
        let value = get_blob(ch)?;
        blocks.push(PropertyBlock { key_id, value });
    }
    Ok(Some(PropertyRecord {
        owner,
        prev_prop,
        next_prop,
        blocks,
    }))
}

fn write_dynamic_records<C: WritableChannel + ?Sized>(
    ch: &mut C,
    records: &[DynamicRecord],
) -> CodecResult<()> {
    put_len(ch, records.len())?;
    for record in records {
        put_u64(ch, record.id)?;
        match &record.data {
            None => ch.put_u8(0)?,
            Some(data) => {
                ch.put_u8(IN_USE)?;
                put_blob(ch, data)?;
            }
        }
    }
    Ok(())
}

fn read_dynamic_records<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<Vec<DynamicRecord>> {
    let count = get_len(ch)?;
    let mut records = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let id = get_u64(ch)?;
        let data = if read_in_use(ch)? & IN_USE == 0 {
            None
        } else {
            Some(get_blob(ch)?)
        };
        records.push(DynamicRecord { id, data });
    }
    Ok(records)
}

fn read_token<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<TokenCommand> {
    let id = ch.get_i32()?;
    let record = if read_in_use(ch)? & IN_USE == 0 {
        None
    } else {
        let name_id = ch.get_i32()?;
        let name_records = read_dynamic_records(ch)?;
        Some(TokenRecord {
            name_id,
            name_records,
        })
    };
    Ok(TokenCommand { id, record })
}

mod legacy_action {
    pub const ADD: u8 = 1;
    pub const REMOVE: u8 = 2;
    pub const DELETE: u8 = 3;
    pub const CREATE: u8 = 4;
}

fn write_legacy_index<C: WritableChannel + ?Sized>(
    ch: &mut C,
    cmd: &LegacyIndexCommand,
) -> CodecResult<()> {
    let action = match cmd.action {
        LegacyIndexAction::Add { .. } => legacy_action::ADD,
        LegacyIndexAction::Remove { .. } => legacy_action::REMOVE,
        LegacyIndexAction::Delete => legacy_action::DELETE,
        LegacyIndexAction::Create { .. } => legacy_action::CREATE,
    };
    ch.put_u8(action)?;
    ch.put_u8(match cmd.entity_type {
        IndexEntityType::Node => 0,
        IndexEntityType::Relationship => 1,
    })?;
    put_string(ch, &cmd.index_name)?;
    match &cmd.action {
        LegacyIndexAction::Add {
            entity_id,
            key,
            value,
        } => {
            put_u64(ch, *entity_id)?;
            put_string(ch, key)?;
            put_blob(ch, value)
        }
        LegacyIndexAction::Remove { entity_id, key } => {
            put_u64(ch, *entity_id)?;
            match key {
                None => put_bool(ch, false),
                Some(key) => {
                    put_bool(ch, true)?;
                    put_string(ch, key)
                }
            }
        }
        LegacyIndexAction::Delete => Ok(()),
        LegacyIndexAction::Create { config } => {
            put_len(ch, config.len())?;
            for (key, value) in config {
                put_string(ch, key)?;
                put_string(ch, value)?;
            }
            Ok(())
        }
    }
}

fn read_legacy_index<C: ReadableChannel + ?Sized>(ch: &mut C) -> CodecResult<LegacyIndexCommand> {
    let action = ch.get_u8()?;
    let entity_type = match ch.get_u8()? {
        0 => IndexEntityType::Node,
        1 => IndexEntityType::Relationship,
        other => {
            return Err(CodecError::invalid_structure(format!(
                "invalid index entity type {other}"
            )))
        }
    };
    let index_name = get_string(ch)?;
    let action = match action {
        legacy_action::ADD => LegacyIndexAction::Add {
            entity_id: get_u64(ch)?,
            key: get_string(ch)?,
            value: get_blob(ch)?,
        },
        legacy_action::REMOVE => {
            let entity_id = get_u64(ch)?;
            let key = if get_bool(ch)? {
                Some(get_string(ch)?)
            } else {
                None
            };
            LegacyIndexAction::Remove { entity_id, key }
        }
        legacy_action::DELETE => LegacyIndexAction::Delete,
        legacy_action::CREATE => {
            let count = get_len(ch)?;
            let mut config = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                config.push((get_string(ch)?, get_string(ch)?));
            }
            LegacyIndexAction::Create { config }
        }
        other => {
            return Err(CodecError::invalid_structure(format!(
                "invalid legacy index action {other}"
            )))
        }
    };
    Ok(LegacyIndexCommand {
        index_name,
        entity_type,
        action,
    })
}
