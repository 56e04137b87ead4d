//! Remote records and their identities.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a remote zone.
///
/// A zone is a remote-side partition with its own independent change cursor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(String);

impl ZoneId {
    /// Creates a zone identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the zone name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The stable identity of a remote record: its zone plus its record name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Zone holding the record.
    pub zone: ZoneId,
    /// Record name, unique within the zone.
    pub name: String,
}

impl RecordId {
    /// Creates a record identifier.
    pub fn new(zone: ZoneId, name: impl Into<String>) -> Self {
        Self {
            zone,
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone, self.name)
    }
}

/// A value stored under one key of a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordValue {
    /// UTF-8 text.
    Text(String),
    /// Signed integer.
    Integer(i64),
    /// Point in time, in seconds since the Unix epoch.
    Timestamp(i64),
    /// Opaque bytes (serialized structures, assets).
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<RecordValue>),
}

impl RecordValue {
    /// Returns the text if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RecordValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RecordValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the timestamp if this is a timestamp value.
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            RecordValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns the bytes if this is a byte value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RecordValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the elements if this is a list value.
    pub fn as_list(&self) -> Option<&[RecordValue]> {
        match self {
            RecordValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Remote-owned metadata carried alongside a record.
///
/// Kept locally after a successful push or download so later updates and
/// deletes can be sent without refetching the record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFields(Vec<u8>);

impl SystemFields {
    /// Wraps remote-supplied bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SystemFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemFields({} bytes)", self.0.len())
    }
}

/// A keyed bag of values with a stable identity and a type discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Record identity.
    pub id: RecordId,
    /// Record type (e.g. `"Book"`).
    pub record_type: String,
    /// Keyed values. Absent keys are null.
    pub fields: BTreeMap<String, RecordValue>,
    /// Remote metadata, present once the record exists remotely.
    pub system_fields: Option<SystemFields>,
}

impl RemoteRecord {
    /// Creates an empty record.
    pub fn new(id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            system_fields: None,
        }
    }

    /// Sets the system fields.
    pub fn with_system_fields(mut self, system_fields: Option<SystemFields>) -> Self {
        self.system_fields = system_fields;
        self
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.fields.get(key)
    }

    /// Stores `value` under `key`; `None` removes the key.
    pub fn set(&mut self, key: impl Into<String>, value: Option<RecordValue>) {
        let key = key.into();
        match value {
            Some(value) => {
                self.fields.insert(key, value);
            }
            None => {
                self.fields.remove(&key);
            }
        }
    }

    /// Returns the record name.
    pub fn name(&self) -> &str {
        &self.id.name
    }
}
