// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay of a peer's batch file against the local tables.
//!
//! # Algorithm
//!
//! 1. Check the password, pick the file, decrypt it. An authentication
//!    failure aborts before anything is written.
//! 2. Mint an import batch id and open one transaction.
//! 3. For each array element, in file order:
//!    - parse it and its operation,
//!    - check the target table (identifier syntax, not the log table,
//!      allow-list, exists),
//!    - normalize and flatten `data` through the table codec,
//!    - stage a copy in the log under the import batch id,
//!    - apply it inside a savepoint.
//! 4. Delete every staged record and commit.
//!
//! Per-record problems never abort the batch. They are collected as
//! [`SkippedRecord`]s and logged at `warn`; only the applied count reaches
//! the operator.
//!
//! # Apply Semantics
//!
//! | Operation | Statement | Counted when |
//! |-----------|-----------|--------------|
//! | insert | `INSERT OR IGNORE` over all columns | a row was inserted |
//! | update | `UPDATE … SET non-pk columns WHERE pk = record_id` | a row matched |
//! | delete | `DELETE … WHERE pk = record_id` | a row was deleted |

use crate::codec::BatchCodec;
use crate::config::{ExportConfig, ImportConfig, SecurityConfig, WeakPasswordPolicy};
use crate::error::{ReplicationError, Result};
use crate::picker::FilePicker;
use crate::record::{BatchEntry, Operation, RecordKey};
use crate::source::{BatchId, SourceTag};
use crate::store::{self, ChangeLogStore, LogRow, LOG_TABLE};
use crate::table_codec::CodecRegistry;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::query::Query;
use sqlx::{Connection, Sqlite};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Why a record in a batch was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Unparseable entry, unusable `data`, or missing primary key.
    MalformedRecord,
    /// The statement ran but affected no row (duplicate insert, update of
    /// an absent row, delete of an absent row).
    ApplyConflict,
    /// Operation outside insert/update/delete.
    UnknownOperation,
    /// Target table is invalid, missing, the log itself, or not allowed.
    RejectedTable,
    /// The statement was refused by SQLite (unknown column, constraint).
    StatementFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MalformedRecord => "malformed_record",
            SkipReason::ApplyConflict => "apply_conflict",
            SkipReason::UnknownOperation => "unknown_operation",
            SkipReason::RejectedTable => "rejected_table",
            SkipReason::StatementFailed => "statement_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record that was not applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    /// Position in the file's array.
    pub index: usize,
    pub table_name: Option<String>,
    pub reason: SkipReason,
    pub detail: String,
}

/// Result of one import.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportOutcome {
    /// Records whose statement affected at least one row.
    pub imported: usize,
    /// Records in the file.
    pub total: usize,
    pub skipped: Vec<SkippedRecord>,
    pub batch_id: Option<BatchId>,
    pub path: Option<PathBuf>,
}

impl ImportOutcome {
    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.iter().filter(|s| s.reason == reason).count()
    }
}

/// Whether a name is safe to splice into SQL as a quoted identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &'q Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.as_str()),
        // flattened rows hold no compound values
        other => query.bind(other.to_string()),
    }
}

fn bind_key<'q>(query: SqliteQuery<'q>, key: &'q RecordKey) -> SqliteQuery<'q> {
    match key {
        RecordKey::Int(n) => query.bind(*n),
        RecordKey::Text(s) => query.bind(s.as_str()),
    }
}

/// Per-entry result inside the replay loop.
enum Replay {
    Applied,
    Skipped(SkipReason, String),
}

fn skip(reason: SkipReason, detail: impl Into<String>) -> Result<Replay> {
    Ok(Replay::Skipped(reason, detail.into()))
}

/// A record that passed validation.
struct Replayable {
    table: String,
    key: RecordKey,
    operation: Operation,
    row: Option<Map<String, Value>>,
    entry_timestamp: Option<chrono::DateTime<Utc>>,
}

/// Replays sealed batch files into the local database.
pub struct Importer {
    store: Arc<ChangeLogStore>,
    security: SecurityConfig,
    config: ImportConfig,
    codecs: Arc<CodecRegistry>,
    file_extension: String,
}

impl Importer {
    pub fn new(
        store: Arc<ChangeLogStore>,
        security: SecurityConfig,
        config: ImportConfig,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            store,
            security,
            config,
            codecs,
            file_extension: ExportConfig::default().file_extension,
        }
    }

    /// Extension offered by the open dialog; matches what exports write.
    pub fn with_file_extension(mut self, extension: &str) -> Self {
        self.file_extension = extension.to_string();
        self
    }

    /// Import the file chosen by `picker`.
    #[instrument(skip_all)]
    pub async fn import(&self, password: &str, picker: &dyn FilePicker) -> Result<ImportOutcome> {
        if let Some(outcome) = self.check_password(password)? {
            return Ok(outcome);
        }
        let Some(path) = picker.open_path(&self.file_extension) else {
            info!("Import cancelled");
            crate::metrics::record_import_skipped("cancelled");
            return Ok(ImportOutcome::default());
        };
        self.import_file(&path, password).await
    }

    /// Import a known file.
    #[instrument(skip(self, path, password), fields(path = %path.display()))]
    pub async fn import_file(&self, path: &Path, password: &str) -> Result<ImportOutcome> {
        if let Some(outcome) = self.check_password(password)? {
            return Ok(outcome);
        }

        let start = Instant::now();
        match self.run(path, password).await {
            Ok(outcome) => {
                crate::metrics::record_import(outcome.total, outcome.imported, start.elapsed());
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), "Import failed, nothing applied");
                crate::metrics::record_import_failed(e.code());
                Err(e)
            }
        }
    }

    /// `Ok(Some(_))` means stop with nothing imported.
    fn check_password(&self, password: &str) -> Result<Option<ImportOutcome>> {
        if self.security.is_acceptable(password) {
            return Ok(None);
        }
        match self.security.weak_password_policy {
            WeakPasswordPolicy::NoOp => {
                warn!(min_len = self.security.min_password_len, "Password too short, nothing imported");
                crate::metrics::record_import_skipped("weak_password");
                Ok(Some(ImportOutcome::default()))
            }
            WeakPasswordPolicy::Reject => Err(ReplicationError::WeakPassword {
                min_len: self.security.min_password_len,
            }),
        }
    }

    async fn run(&self, path: &Path, password: &str) -> Result<ImportOutcome> {
        let sealed = tokio::fs::read(path)
            .await
            .map_err(|e| ReplicationError::io(path, e))?;
        let items = self.open(sealed, password).await?;

        let batch = BatchId::generate();
        let staging = SourceTag::Batch(batch.clone());
        let total = items.len();
        debug!(batch_id = %batch, total, "Batch decrypted");

        let mut tx = self.store.begin().await?;
        let mut tables: HashMap<String, bool> = HashMap::new();
        let mut imported = 0;
        let mut skipped = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            let table_hint = item.get("table_name").and_then(Value::as_str).map(str::to_string);
            match self.replay(&mut tx, &staging, &mut tables, item).await? {
                Replay::Applied => imported += 1,
                Replay::Skipped(reason, detail) => {
                    warn!(index, table = ?table_hint, reason = %reason, detail = %detail, "Skipping record");
                    crate::metrics::record_import_skip(reason.as_str());
                    skipped.push(SkippedRecord {
                        index,
                        table_name: table_hint,
                        reason,
                        detail,
                    });
                }
            }
        }

        let staged = store::delete_batch(&mut tx, &batch).await?;
        tx.commit().await?;

        info!(
            batch_id = %batch,
            total,
            imported,
            skipped = skipped.len(),
            staged,
            "Changes imported"
        );

        Ok(ImportOutcome {
            imported,
            total,
            skipped,
            batch_id: Some(batch),
            path: Some(path.to_path_buf()),
        })
    }

    async fn open(&self, sealed: Vec<u8>, password: &str) -> Result<Vec<Value>> {
        // format and KDF cost are read from the file header
        let codec = BatchCodec::new(self.security.format, self.security.kdf);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || codec.open_batch(&sealed, &password))
            .await
            .map_err(|e| ReplicationError::Internal(format!("Open task failed: {e}")))?
    }

    /// Validate, stage and apply one array element.
    ///
    /// Storage errors outside the savepoint abort the whole import.
    async fn replay(
        &self,
        conn: &mut SqliteConnection,
        staging: &SourceTag,
        tables: &mut HashMap<String, bool>,
        item: Value,
    ) -> Result<Replay> {
        let record = match self.validate(conn, tables, item).await? {
            Ok(record) => record,
            Err(skipped) => return Ok(skipped),
        };

        let data = record.row.as_ref().map(serde_json::to_string).transpose()?;
        store::insert_row(
            conn,
            &LogRow {
                table_name: &record.table,
                record_id: &record.key,
                operation: record.operation,
                data: data.as_deref(),
                source: staging,
                timestamp: record.entry_timestamp.unwrap_or_else(Utc::now),
            },
        )
        .await?;

        let mut savepoint = conn.begin().await?;
        match apply(&mut savepoint, &record, self.codecs.primary_key(&record.table)).await {
            Ok(0) => {
                savepoint.commit().await?;
                skip(
                    SkipReason::ApplyConflict,
                    format!("{} of {} affected no row", record.operation, record.key),
                )
            }
            Ok(rows) => {
                savepoint.commit().await?;
                debug!(table = %record.table, record_id = %record.key, operation = %record.operation, rows, "Record applied");
                Ok(Replay::Applied)
            }
            Err(e) => {
                savepoint.rollback().await?;
                skip(SkipReason::StatementFailed, e.to_string())
            }
        }
    }

    /// Turn one array element into a [`Replayable`], or say why not.
    async fn validate(
        &self,
        conn: &mut SqliteConnection,
        tables: &mut HashMap<String, bool>,
        item: Value,
    ) -> Result<std::result::Result<Replayable, Replay>> {
        let rejected = |reason: SkipReason, detail: String| -> Result<std::result::Result<Replayable, Replay>> {
            Ok(Err(Replay::Skipped(reason, detail)))
        };

        let entry = match BatchEntry::from_value(item) {
            Ok(entry) => entry,
            Err(e) => return rejected(SkipReason::MalformedRecord, e),
        };
        let operation: Operation = match entry.operation.parse() {
            Ok(op) => op,
            Err(e) => return rejected(SkipReason::UnknownOperation, e),
        };

        let table = entry.table_name;
        if !is_valid_identifier(&table) {
            return rejected(SkipReason::RejectedTable, format!("invalid table name {table:?}"));
        }
        if table == LOG_TABLE {
            return rejected(SkipReason::RejectedTable, "the change log is not a replay target".into());
        }
        if !self.config.is_table_allowed(&table) {
            return rejected(SkipReason::RejectedTable, format!("{table} is not on the allow-list"));
        }
        let exists = match tables.get(&table) {
            Some(exists) => *exists,
            None => {
                let exists = store::table_exists(conn, &table).await?;
                tables.insert(table.clone(), exists);
                exists
            }
        };
        if !exists {
            return rejected(SkipReason::RejectedTable, format!("no such table {table}"));
        }

        if entry.record_id.is_empty() {
            return rejected(SkipReason::MalformedRecord, "empty record_id".into());
        }

        let row = if entry.data.is_null() {
            None
        } else {
            match self.codecs.normalize(&table, entry.data) {
                Ok(row) => Some(row),
                Err(e) if operation.requires_key_in_data() => {
                    return rejected(SkipReason::MalformedRecord, e);
                }
                // a delete is located by record_id alone
                Err(_) => None,
            }
        };

        if operation.requires_key_in_data() {
            let pk = self.codecs.primary_key(&table);
            let has_key = row
                .as_ref()
                .and_then(|r| r.get(pk))
                .is_some_and(|v| !v.is_null());
            if !has_key {
                return rejected(SkipReason::MalformedRecord, format!("data has no {pk:?} field"));
            }
            if let Some(bad) = row.iter().flat_map(|r| r.keys()).find(|k| !is_valid_identifier(k)) {
                return rejected(SkipReason::MalformedRecord, format!("invalid column name {bad:?}"));
            }
        }

        Ok(Ok(Replayable {
            table,
            key: entry.record_id,
            operation,
            row,
            entry_timestamp: entry.timestamp,
        }))
    }
}

/// Run the record's statement, returning rows affected.
async fn apply(conn: &mut SqliteConnection, record: &Replayable, pk: &str) -> std::result::Result<u64, sqlx::Error> {
    let table = quote(&record.table);

    match (record.operation, &record.row) {
        (Operation::Insert, Some(row)) => {
            let columns: Vec<String> = row.keys().map(|k| quote(k)).collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT OR IGNORE INTO {table} ({}) VALUES ({placeholders})",
                columns.join(", ")
            );
            let mut query = sqlx::query(&sql);
            for value in row.values() {
                query = bind_value(query, value);
            }
            Ok(query.execute(conn).await?.rows_affected())
        }
        (Operation::Update, Some(row)) => {
            let assignments: Vec<(&String, &Value)> = row.iter().filter(|(k, _)| k.as_str() != pk).collect();
            if assignments.is_empty() {
                return Ok(0);
            }
            let set = assignments
                .iter()
                .map(|(k, _)| format!("{} = ?", quote(k)))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("UPDATE {table} SET {set} WHERE {} = ?", quote(pk));
            let mut query = sqlx::query(&sql);
            for (_, value) in &assignments {
                query = bind_value(query, value);
            }
            query = bind_key(query, &record.key);
            Ok(query.execute(conn).await?.rows_affected())
        }
        (Operation::Delete, _) => {
            let sql = format!("DELETE FROM {table} WHERE {} = ?", quote(pk));
            let query = bind_key(sqlx::query(&sql), &record.key);
            Ok(query.execute(conn).await?.rows_affected())
        }
        // insert/update without data never pass validation
        (_, None) => Ok(0),
    }
}
