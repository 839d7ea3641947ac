//! Record keys, identifier generation and the application's domain records.
//!
//! The store itself treats records as opaque JSON objects. The typed records
//! below are what the application keeps in each collection; they convert to and
//! from [`serde_json::Value`] through serde, with camelCase field names so the
//! secondary index fields (`createdAt`, `updatedAt`, `type`, `category`,
//! `workId`) line up with the registered schema.

use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::store_error::{Result, StoreError};

/// Longest LMDB key, in bytes.
pub const MAX_KEY_BYTES: usize = 511;

/// Primary key of a stored record: a JSON integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Reads a key out of a JSON value. Only integers and strings are keys.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n.as_i64().map(RecordKey::Int),
            JsonValue::String(s) => Some(RecordKey::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            RecordKey::Int(n) => JsonValue::from(*n),
            RecordKey::Text(s) => JsonValue::from(s.as_str()),
        }
    }

    /// JSON encoding used as the LMDB key. Fails with
    /// [`StoreError::SchemaViolation`] when it exceeds [`MAX_KEY_BYTES`].
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let encoded = serde_json::to_vec(self)?;
        if encoded.len() > MAX_KEY_BYTES {
            return Err(StoreError::schema(format!(
                "primary key of {} encoded bytes exceeds the {MAX_KEY_BYTES}-byte limit",
                encoded.len()
            )));
        }
        Ok(encoded)
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKey::Int(n) => write!(f, "{n}"),
            RecordKey::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        RecordKey::Int(value)
    }
}

impl From<i32> for RecordKey {
    fn from(value: i32) -> Self {
        RecordKey::Int(i64::from(value))
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey::Text(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey::Text(value)
    }
}

/// Source of identifiers for records added without a primary key.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> i64;
}

/// `current time in milliseconds + random offset in 0..1000`.
///
/// Two inserts inside the same millisecond can draw the same offset; the
/// repository then reports [`StoreError::DuplicateKey`] instead of overwriting.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampIdGenerator;

impl IdGenerator for TimestampIdGenerator {
    fn next_id(&self) -> i64 {
        now_millis() + rand::rng().random_range(0..1000)
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub completed: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkType {
    Novel,
    ShortStory,
    Poem,
    Script,
    Essay,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type")]
    pub work_type: WorkType,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromptType {
    Outline,
    Continue,
    Polish,
    Character,
    Worldbuilding,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub prompt_type: PromptType,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Saved material: character sheets, settings, drafts, anything the writer
/// files away, optionally attached to a work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub content: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A node on the creative map (mind-map of ideas for a work).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreativeMapItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}
