//! Data model for block state-change events
//!
//! Mirrors the JSON the upstream webhook emits: a block [`Clock`], the producing
//! module's [`Manifest`], and the entity or table changes carried in `data`.
//! Decoding is lenient where the producers disagree (numbers sent as strings,
//! `"true"`/`"false"` flags) and strict about field value tags.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

/// Chain position a change belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    #[serde(
        rename = "number",
        alias = "blockNumber",
        deserialize_with = "de_u64_lenient"
    )]
    pub block_number: u64,

    #[serde(rename = "id", alias = "blockId")]
    pub block_id: String,

    pub timestamp: DateTime<Utc>,
}

/// Identity of the module that produced a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub chain: String,
    pub module_hash: String,
    pub module_name: String,
    #[serde(rename = "type")]
    pub output_type: String,
    #[serde(default, deserialize_with = "de_bool_lenient")]
    pub final_block_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Operation {
    #[default]
    #[serde(rename = "OPERATION_UNSPECIFIED", alias = "UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "OPERATION_CREATE", alias = "CREATE")]
    Create,
    #[serde(rename = "OPERATION_UPDATE", alias = "UPDATE")]
    Update,
    #[serde(rename = "OPERATION_DELETE", alias = "DELETE")]
    Delete,
    #[serde(rename = "OPERATION_FINAL", alias = "FINAL")]
    Final,
}

impl Operation {
    /// Column value written to the sink
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Unspecified => "UNSPECIFIED",
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Final => "FINAL",
        }
    }
}

/// Typed value attached to one field of an entity change
///
/// On the wire exactly one tag is populated: `{"int32": 1}`, `{"bigint": "1"}`,
/// `{"array": {"value": [...]}}`. An object with no tag is `Null`; unknown
/// tags and objects with several tags are rejected while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "WireValue", into = "WireValue")]
pub enum FieldValue {
    Int32(i32),
    Bigint(String),
    Bigdecimal(String),
    String(String),
    /// Hex encoded
    Bytes(String),
    Bool(bool),
    Array(Vec<FieldValue>),
    #[default]
    Null,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    int32: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bigint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bigdecimal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bool: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    array: Option<WireArray>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireArray {
    #[serde(default)]
    value: Vec<FieldValue>,
}

impl TryFrom<WireValue> for FieldValue {
    type Error = String;

    fn try_from(wire: WireValue) -> Result<Self, Self::Error> {
        let mut tags = Vec::with_capacity(1);
        if let Some(v) = wire.int32 {
            tags.push(FieldValue::Int32(v));
        }
        if let Some(v) = wire.bigint {
            tags.push(FieldValue::Bigint(v));
        }
        if let Some(v) = wire.bigdecimal {
            tags.push(FieldValue::Bigdecimal(v));
        }
        if let Some(v) = wire.string {
            tags.push(FieldValue::String(v));
        }
        if let Some(v) = wire.bytes {
            tags.push(FieldValue::Bytes(v));
        }
        if let Some(v) = wire.bool {
            tags.push(FieldValue::Bool(v));
        }
        if let Some(v) = wire.array {
            tags.push(FieldValue::Array(v.value));
        }

        match tags.len() {
            0 => Ok(FieldValue::Null),
            1 => Ok(tags.remove(0)),
            n => Err(format!("field value carries {} tags, expected exactly one", n)),
        }
    }
}

impl From<FieldValue> for WireValue {
    fn from(value: FieldValue) -> Self {
        let mut wire = WireValue::default();
        match value {
            FieldValue::Int32(v) => wire.int32 = Some(v),
            FieldValue::Bigint(v) => wire.bigint = Some(v),
            FieldValue::Bigdecimal(v) => wire.bigdecimal = Some(v),
            FieldValue::String(v) => wire.string = Some(v),
            FieldValue::Bytes(v) => wire.bytes = Some(v),
            FieldValue::Bool(v) => wire.bool = Some(v),
            FieldValue::Array(value) => wire.array = Some(WireArray { value }),
            FieldValue::Null => {}
        }
        wire
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(
        rename = "newValue",
        alias = "value",
        default,
        deserialize_with = "de_nullable_value"
    )]
    pub value: FieldValue,
}

impl Field {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One row-level change destined for table `entity`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity: String,
    pub id: String,
    #[serde(default)]
    pub operation: Operation,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// Database-changes flavour of a change: plain string values keyed by `pk`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableChange {
    pub table: String,
    #[serde(default)]
    pub pk: String,
    #[serde(default)]
    pub operation: Operation,
    #[serde(default)]
    pub fields: Vec<TableField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableField {
    pub name: String,
    #[serde(rename = "newValue", alias = "new_value", default)]
    pub new_value: String,
}

impl From<TableChange> for EntityChange {
    fn from(change: TableChange) -> Self {
        EntityChange {
            entity: change.table,
            id: change.pk,
            operation: change.operation,
            fields: change
                .fields
                .into_iter()
                .map(|f| Field::new(f.name, FieldValue::String(f.new_value)))
                .collect(),
        }
    }
}

fn de_nullable_value<'de, D>(deserializer: D) -> Result<FieldValue, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<FieldValue>::deserialize(deserializer)?.unwrap_or_default())
}

fn de_u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Int(n) => Ok(n),
        Repr::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

fn de_bool_lenient<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Bool(bool),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Bool(b) => Ok(b),
        Repr::Text(s) => s.trim().to_lowercase().parse().map_err(de::Error::custom),
    }
}
