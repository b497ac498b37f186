// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capture of local mutations into the change log.
//!
//! The application calls [`ChangeRecorder::record`] once per logical
//! mutation, after its own write. Recording is a side effect: it never
//! returns an error. Incomplete or unserializable captures are logged at
//! `warn` and dropped so that the caller's write path is unaffected.
//!
//! ```rust,no_run
//! # use changelog_replication::{ChangeRecorder, NewChange, Operation};
//! # use serde_json::json;
//! # async fn example(recorder: &ChangeRecorder) {
//! recorder
//!     .record(NewChange::new("users", 7, Operation::Insert).with_data(json!({"id": 7, "name": "A"})))
//!     .await;
//! # }
//! ```

use crate::record::{Operation, RecordKey};
use crate::source::SourceTag;
use crate::store::{self, ChangeLogStore, LogRow, LOG_TABLE};
use crate::table_codec::CodecRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use tracing::{debug, warn};

/// One mutation as reported by the application.
///
/// Fields are checked when the change is recorded, not when it is built, so
/// a half-filled capture from a dynamic write path is dropped with a
/// diagnostic instead of failing at the call site.
#[derive(Debug, Clone)]
pub struct NewChange {
    table_name: String,
    record_id: Option<RecordKey>,
    operation: String,
    data: Result<Option<Value>, String>,
    source: SourceTag,
}

impl NewChange {
    pub fn new(table_name: &str, record_id: impl Into<RecordKey>, operation: Operation) -> Self {
        Self {
            table_name: table_name.to_string(),
            record_id: Some(record_id.into()),
            operation: operation.as_str().to_string(),
            data: Ok(None),
            source: SourceTag::Local,
        }
    }

    /// Build from untyped inputs (e.g. a generic CRUD handler).
    pub fn raw(table_name: &str, record_id: Option<RecordKey>, operation: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            record_id,
            operation: operation.to_string(),
            data: Ok(None),
            source: SourceTag::Local,
        }
    }

    /// Attach the row snapshot.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Ok(Some(data));
        self
    }

    /// Attach a row snapshot from any serializable value.
    ///
    /// A serialization failure is kept and reported when the change is
    /// recorded.
    pub fn with_serialized<T: Serialize>(mut self, row: &T) -> Self {
        self.data = serde_json::to_value(row).map(Some).map_err(|e| e.to_string());
        self
    }

    /// Override the default `local` tag.
    pub fn with_source(mut self, source: SourceTag) -> Self {
        self.source = source;
        self
    }
}

/// A capture that passed validation, ready to insert.
struct Prepared {
    table_name: String,
    record_id: RecordKey,
    operation: Operation,
    data: Option<String>,
    source: SourceTag,
    timestamp: DateTime<Utc>,
}

impl Prepared {
    fn row(&self) -> LogRow<'_> {
        LogRow {
            table_name: &self.table_name,
            record_id: &self.record_id,
            operation: self.operation,
            data: self.data.as_deref(),
            source: &self.source,
            timestamp: self.timestamp,
        }
    }
}

/// Appends change records on behalf of the application's write paths.
#[derive(Clone)]
pub struct ChangeRecorder {
    store: Arc<ChangeLogStore>,
    codecs: Arc<CodecRegistry>,
}

impl ChangeRecorder {
    pub fn new(store: Arc<ChangeLogStore>, codecs: Arc<CodecRegistry>) -> Self {
        Self { store, codecs }
    }

    /// Record one mutation. Never fails the caller.
    pub async fn record(&self, change: NewChange) {
        let Some(prepared) = self.prepare(change) else {
            return;
        };
        match self.store.append(&prepared.row()).await {
            Ok(id) => self.logged(&prepared, id),
            Err(e) => {
                warn!(table = %prepared.table_name, record_id = %prepared.record_id, error = %e, "Failed to append change record");
                crate::metrics::record_change_dropped("storage");
            }
        }
    }

    /// Record one mutation on the caller's connection, so the log entry
    /// commits or rolls back with the caller's own transaction.
    pub async fn record_in(&self, conn: &mut SqliteConnection, change: NewChange) {
        let Some(prepared) = self.prepare(change) else {
            return;
        };
        match store::insert_row(conn, &prepared.row()).await {
            Ok(id) => self.logged(&prepared, id),
            Err(e) => {
                warn!(table = %prepared.table_name, record_id = %prepared.record_id, error = %e, "Failed to append change record");
                crate::metrics::record_change_dropped("storage");
            }
        }
    }

    fn logged(&self, prepared: &Prepared, id: i64) {
        debug!(
            id,
            table = %prepared.table_name,
            record_id = %prepared.record_id,
            operation = %prepared.operation,
            "Change recorded"
        );
        crate::metrics::record_change_logged(&prepared.table_name, prepared.operation.as_str());
    }

    fn prepare(&self, change: NewChange) -> Option<Prepared> {
        let NewChange {
            table_name,
            record_id,
            operation,
            data,
            source,
        } = change;

        let reject = |reason: &str, detail: &str| {
            warn!(table = %table_name, reason, detail, "Dropping change capture");
            crate::metrics::record_change_dropped(reason);
        };

        if table_name.is_empty() {
            reject("missing_table", "table name is empty");
            return None;
        }
        if table_name == LOG_TABLE {
            reject("log_table", "the change log is not replicated");
            return None;
        }
        let record_id = match record_id {
            Some(key) if !key.is_empty() => key,
            _ => {
                reject("missing_record_id", "record id is absent");
                return None;
            }
        };
        if operation.trim().is_empty() {
            reject("missing_operation", "operation is empty");
            return None;
        }
        let operation: Operation = match operation.parse() {
            Ok(op) => op,
            Err(e) => {
                reject("unknown_operation", &e);
                return None;
            }
        };

        let data = match data {
            Ok(data) => data.filter(|v| !v.is_null()),
            Err(e) => {
                reject("serialization", &e);
                return None;
            }
        };

        let row = match data {
            Some(value) => match self.codecs.normalize(&table_name, value) {
                Ok(row) => Some(row),
                Err(e) => {
                    reject("malformed_data", &e);
                    return None;
                }
            },
            None => None,
        };

        if operation.requires_key_in_data() {
            let pk = self.codecs.primary_key(&table_name);
            let has_key = row
                .as_ref()
                .and_then(|r| r.get(pk))
                .is_some_and(|v| !v.is_null());
            if !has_key {
                reject("missing_primary_key", &format!("data has no {pk:?} field"));
                return None;
            }
        }

        let data = match row.map(|r| serde_json::to_string(&r)).transpose() {
            Ok(text) => text,
            Err(e) => {
                reject("serialization", &e.to_string());
                return None;
            }
        };

        Some(Prepared {
            table_name,
            record_id,
            operation,
            data,
            source,
            timestamp: Utc::now(),
        })
    }
}
