// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Declarative per-table field mapping.
//!
//! Replicated tables are flat: every column holds a scalar. Row snapshots
//! produced by the application are not always flat (a directive carries a
//! `period: {from, to}` object and a `file` object). Before a snapshot is
//! written to the log, and again before it is replayed, it is run through the
//! table's [`TableCodec`]:
//!
//! 1. Each configured [`FieldRule`] is applied in order.
//! 2. Any value that is still an object or array is stored as its JSON text.
//!
//! The registry is shared by the recorder (capture) and the importer (replay)
//! so both sides agree on the column shape.
//!
//! # YAML Example
//!
//! ```yaml
//! import:
//!   tables:
//!     - table: user_directives
//!       rules:
//!         - rule: split
//!           field: period
//!           columns:
//!             - { key: from, column: period_from }
//!             - { key: to, column: period_to }
//!           fill: ""
//!         - rule: stringify
//!           field: file
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Target column for one key of a split object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitColumn {
    /// Key inside the nested object.
    pub key: String,
    /// Flat column receiving the value.
    pub column: String,
}

impl SplitColumn {
    pub fn new(key: &str, column: &str) -> Self {
        Self {
            key: key.to_string(),
            column: column.to_string(),
        }
    }
}

/// One field-mapping rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    /// Replace a nested object with one column per listed key.
    ///
    /// Missing or null keys are written as `fill` when set, and left out
    /// otherwise.
    Split {
        field: String,
        columns: Vec<SplitColumn>,
        #[serde(default)]
        fill: Option<Value>,
    },
    /// Store a compound value as its JSON text.
    Stringify { field: String },
    /// Move a value to a differently named column.
    Rename { from: String, to: String },
    /// Remove a field that has no column.
    Drop { field: String },
}

impl FieldRule {
    fn apply(&self, row: &mut Map<String, Value>) {
        match self {
            FieldRule::Split {
                field,
                columns,
                fill,
            } => {
                let Some(nested) = row.remove(field) else {
                    return;
                };
                for col in columns {
                    let value = nested
                        .get(&col.key)
                        .filter(|v| !v.is_null())
                        .cloned()
                        .or_else(|| fill.clone());
                    if let Some(value) = value {
                        row.insert(col.column.clone(), value);
                    }
                }
            }
            FieldRule::Stringify { field } => {
                if let Some(value) = row.get_mut(field) {
                    if value.is_object() || value.is_array() {
                        *value = Value::String(value.to_string());
                    }
                }
            }
            FieldRule::Rename { from, to } => {
                if let Some(value) = row.remove(from) {
                    row.insert(to.clone(), value);
                }
            }
            FieldRule::Drop { field } => {
                row.remove(field);
            }
        }
    }
}

/// Field mapping for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCodec {
    pub table: String,
    /// Primary key column, when it is not the registry default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub rules: Vec<FieldRule>,
}

impl TableCodec {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            primary_key: None,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_primary_key(mut self, column: &str) -> Self {
        self.primary_key = Some(column.to_string());
        self
    }
}

/// Codecs the application ships with.
///
/// `user_directives` stores its period as two text columns and its attached
/// file descriptor as JSON text.
pub fn default_table_codecs() -> Vec<TableCodec> {
    vec![TableCodec::new("user_directives")
        .with_rule(FieldRule::Split {
            field: "period".to_string(),
            columns: vec![
                SplitColumn::new("from", "period_from"),
                SplitColumn::new("to", "period_to"),
            ],
            fill: Some(Value::String(String::new())),
        })
        .with_rule(FieldRule::Stringify {
            field: "file".to_string(),
        })]
}

/// Lookup of table codecs by table name.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    default_primary_key: String,
    tables: HashMap<String, TableCodec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new("id", default_table_codecs())
    }
}

impl CodecRegistry {
    /// Build a registry. Later codecs for the same table replace earlier ones.
    pub fn new(default_primary_key: &str, codecs: impl IntoIterator<Item = TableCodec>) -> Self {
        let tables = codecs
            .into_iter()
            .map(|codec| (codec.table.clone(), codec))
            .collect();
        Self {
            default_primary_key: default_primary_key.to_string(),
            tables,
        }
    }

    /// Primary key column for a table.
    pub fn primary_key(&self, table: &str) -> &str {
        self.tables
            .get(table)
            .and_then(|codec| codec.primary_key.as_deref())
            .unwrap_or(&self.default_primary_key)
    }

    pub fn codec(&self, table: &str) -> Option<&TableCodec> {
        self.tables.get(table)
    }

    /// Flatten a row snapshot in place to the table's column shape.
    pub fn flatten(&self, table: &str, row: &mut Map<String, Value>) {
        if let Some(codec) = self.tables.get(table) {
            for rule in &codec.rules {
                rule.apply(row);
            }
        }

        for value in row.values_mut() {
            if value.is_object() || value.is_array() {
                *value = Value::String(value.to_string());
            }
        }
    }

    /// Normalize a snapshot that may arrive as an object or as JSON text
    /// holding an object, then flatten it.
    pub fn normalize(&self, table: &str, data: Value) -> Result<Map<String, Value>, String> {
        let mut row = match data {
            Value::Object(map) => map,
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(other) => return Err(format!("data is encoded {}, not an object", json_kind(&other))),
                Err(e) => return Err(format!("data is not valid JSON: {e}")),
            },
            other => return Err(format!("data is {}, not an object", json_kind(&other))),
        };
        self.flatten(table, &mut row);
        Ok(row)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
