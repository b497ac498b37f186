// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change records: the unit of replication.
//!
//! Two shapes exist:
//!
//! - [`ChangeRecord`] is a row of the local `change_history` table, with
//!   typed fields.
//! - [`BatchEntry`] is one element of the JSON array inside an exported file.
//!   It is deliberately lenient because peers (including older producers)
//!   may send `data` as an encoded string, `record_id` as a number or a
//!   string, and timestamps in several formats.
//!
//! ```json
//! {
//!   "id": 41,
//!   "table_name": "users",
//!   "record_id": 7,
//!   "operation": "update",
//!   "data": {"id": 7, "name": "B"},
//!   "source_id": "9f2c…",
//!   "timestamp": "2026-03-01T10:15:00.120Z"
//! }
//! ```

use crate::source::SourceTag;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Whether `data` must carry the row's primary key.
    pub fn requires_key_in_data(&self) -> bool {
        matches!(self, Operation::Insert | Operation::Update)
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other:?}")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of the affected row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Interpret a `record_id` column value.
    ///
    /// Only strings that print back identically become integers, so `"007"`
    /// stays text.
    pub fn from_column(value: &str) -> Self {
        match value.parse::<i64>() {
            Ok(n) if n.to_string() == value => RecordKey::Int(n),
            _ => RecordKey::Text(value.to_string()),
        }
    }

    /// Whether the key is present at all (non-empty text).
    pub fn is_empty(&self) -> bool {
        matches!(self, RecordKey::Text(s) if s.is_empty())
    }

    pub fn to_json(&self) -> Value {
        match self {
            RecordKey::Int(n) => Value::from(*n),
            RecordKey::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(n) => write!(f, "{n}"),
            RecordKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(n: i64) -> Self {
        RecordKey::Int(n)
    }
}

impl From<i32> for RecordKey {
    fn from(n: i32) -> Self {
        RecordKey::Int(n as i64)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        RecordKey::Text(s.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        RecordKey::Text(s)
    }
}

/// A row of the local change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Storage-assigned id, meaningless across replicas.
    pub id: i64,
    pub table_name: String,
    pub record_id: RecordKey,
    pub operation: Operation,
    /// Row snapshot. `None` when the writer supplied no data.
    pub data: Option<Value>,
    pub source: SourceTag,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    /// Wire form for an exported batch.
    pub fn to_entry(&self) -> BatchEntry {
        BatchEntry {
            id: Some(self.id),
            table_name: self.table_name.clone(),
            record_id: self.record_id.clone(),
            operation: self.operation.as_str().to_string(),
            data: self.data.clone().unwrap_or(Value::Null),
            source_id: Some(self.source.as_column().to_string()),
            timestamp: Some(self.timestamp),
        }
    }
}

/// One element of the JSON array carried in a batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// Producer's local log id, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub table_name: String,
    pub record_id: RecordKey,
    /// Kept as text so unknown operations survive parsing and can be
    /// skipped individually.
    pub operation: String,
    /// Row snapshot, either a JSON object or a string holding one.
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl BatchEntry {
    /// Parse one array element, reporting why it is unusable.
    pub fn from_value(value: Value) -> Result<Self, String> {
        serde_json::from_value(value).map_err(|e| e.to_string())
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (UTC) or epoch milliseconds.
/// Anything else is treated as absent rather than failing the record.
fn deserialize_lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

/// Parse a timestamp in any of the formats peers are known to send.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}
