// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change log persistence.
//!
//! The log is the `change_history` table in the application's own SQLite
//! database. It is a queue, not a history: records are appended by the
//! recorder, relabelled and deleted by exports, and staged and deleted by
//! imports.
//!
//! ```text
//! id | table_name | record_id | operation | data (JSON) | source_id | timestamp (ms)
//! ```
//!
//! # Transactions
//!
//! Every statement helper takes a `&mut SqliteConnection`, so an export or
//! import can run all of its steps inside one transaction obtained from
//! [`ChangeLogStore::begin`]. Pool-level convenience calls retry on
//! SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
//!
//! # Ordering
//!
//! `timestamp` is stored as epoch milliseconds. Batches are read ordered by
//! `(timestamp, id)`, so two changes in the same millisecond keep the order
//! in which they were appended.

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use crate::record::{ChangeRecord, Operation, RecordKey};
use crate::source::{BatchId, SourceTag, LOCAL};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the log table. Never a valid replay target.
pub const LOG_TABLE: &str = "change_history";

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// A log row about to be inserted.
#[derive(Debug, Clone)]
pub struct LogRow<'a> {
    pub table_name: &'a str,
    pub record_id: &'a RecordKey,
    pub operation: Operation,
    /// JSON text of the row snapshot.
    pub data: Option<&'a str>,
    pub source: &'a SourceTag,
    pub timestamp: DateTime<Utc>,
}

/// Insert one log row, returning its id.
pub async fn insert_row(conn: &mut SqliteConnection, row: &LogRow<'_>) -> std::result::Result<i64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO change_history (table_name, record_id, operation, data, source_id, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.table_name)
    .bind(row.record_id.to_string())
    .bind(row.operation.as_str())
    .bind(row.data)
    .bind(row.source.as_column())
    .bind(row.timestamp.timestamp_millis())
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Move every local record into an export batch. Returns the number relabelled.
pub async fn relabel_local(conn: &mut SqliteConnection, batch: &BatchId) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE change_history SET source_id = ? WHERE source_id IS NULL OR source_id = '' OR source_id = ?",
    )
    .bind(batch.as_str())
    .bind(LOCAL)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Read a batch in replay order.
///
/// Rows whose operation is not one of insert/update/delete were not written
/// by this crate; they are logged and left out, since no replica could
/// apply them.
pub async fn fetch_batch(conn: &mut SqliteConnection, batch: &BatchId) -> Result<Vec<ChangeRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, table_name, record_id, operation, data, source_id, timestamp
        FROM change_history
        WHERE source_id = ?
        ORDER BY timestamp ASC, id ASC
        "#,
    )
    .bind(batch.as_str())
    .fetch_all(conn)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        match record_from_row(row)? {
            Some(record) => records.push(record),
            None => continue,
        }
    }
    Ok(records)
}

/// Delete every record carrying a batch tag. Returns the number deleted.
pub async fn delete_batch(conn: &mut SqliteConnection, batch: &BatchId) -> Result<u64> {
    let result = sqlx::query("DELETE FROM change_history WHERE source_id = ?")
        .bind(batch.as_str())
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

/// Whether a table exists in the database.
pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let found: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(conn)
            .await?;
    Ok(found.is_some())
}

fn record_from_row(row: &SqliteRow) -> Result<Option<ChangeRecord>> {
    let id: i64 = row.try_get("id")?;
    let operation_text: String = row.try_get("operation")?;
    let operation = match Operation::from_str(&operation_text) {
        Ok(op) => op,
        Err(e) => {
            warn!(id, error = %e, "Skipping log row with unknown operation");
            return Ok(None);
        }
    };

    let data = row
        .try_get::<Option<String>, _>("data")?
        .map(|text| serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)));
    let source_id: Option<String> = row.try_get("source_id")?;
    let record_id: String = row.try_get("record_id")?;
    let timestamp_ms: i64 = row.try_get("timestamp")?;

    Ok(Some(ChangeRecord {
        id,
        table_name: row.try_get("table_name")?,
        record_id: RecordKey::from_column(&record_id),
        operation,
        data,
        source: SourceTag::from_column(source_id.as_deref()),
        timestamp: DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default(),
    }))
}

/// Persistent change log backed by SQLite.
pub struct ChangeLogStore {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Path to database file
    path: String,
}

impl ChangeLogStore {
    /// Open (or create) the database and the log table.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Initializing change log store");

        let url = if config.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .busy_timeout(config.busy_timeout_duration())
            .create_if_missing(true);

        if config.wal_mode && !config.is_in_memory() {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // An in-memory database lives and dies with its one connection.
        let pool = if config.is_in_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(2) // Single writer; one spare for reads
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                data TEXT,
                source_id TEXT,
                timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_change_history_source ON change_history(source_id)")
            .execute(&pool)
            .await?;

        let store = Self { pool, path };
        let pending = store.pending_count().await?;
        if pending > 0 {
            info!(pending, "Change log has unexported records");
        }
        crate::metrics::set_pending_changes(pending);

        Ok(store)
    }

    /// The underlying pool, shared with the application's own write paths.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction covering log and replicated tables.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Append one record outside any caller transaction.
    /// Retries on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
    pub async fn append(&self, row: &LogRow<'_>) -> Result<i64> {
        let pool = &self.pool;
        let id = execute_with_retry("log_append", || async {
            let mut conn = pool.acquire().await?;
            insert_row(&mut conn, row).await
        })
        .await?;
        Ok(id)
    }

    /// Number of records not yet exported.
    pub async fn pending_count(&self) -> Result<u64> {
        let pool = &self.pool;
        let (count,): (i64,) = execute_with_retry("log_pending_count", || async {
            sqlx::query_as(
                "SELECT COUNT(*) FROM change_history WHERE source_id IS NULL OR source_id = '' OR source_id = ?",
            )
            .bind(LOCAL)
            .fetch_one(pool)
            .await
        })
        .await?;
        Ok(count as u64)
    }

    /// Number of records carrying a source tag.
    pub async fn count_by_source(&self, tag: &SourceTag) -> Result<u64> {
        let batch = match tag {
            SourceTag::Local => return self.pending_count().await,
            SourceTag::Batch(batch) => batch,
        };
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM change_history WHERE source_id = ?")
            .bind(batch.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Every record in the log, in replay order (for diagnostics).
    pub async fn all(&self) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, table_name, record_id, operation, data, source_id, timestamp
            FROM change_history
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(record) = record_from_row(row)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    /// Retries on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("log_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully, checkpointing WAL first.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Change log store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_temp(dir: &tempfile::TempDir, name: &str) -> ChangeLogStore {
        let path = dir.path().join(name);
        ChangeLogStore::open(&StoreConfig::at(path.to_str().unwrap()))
            .await
            .unwrap()
    }

    fn row<'a>(table: &'a str, key: &'a RecordKey, data: Option<&'a str>, source: &'a SourceTag, ms: i64) -> LogRow<'a> {
        LogRow {
            table_name: table,
            record_id: key,
            operation: Operation::Update,
            data,
            source,
            timestamp: DateTime::from_timestamp_millis(ms).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_append_and_pending_count() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir, "append.db").await;

        assert_eq!(store.pending_count().await.unwrap(), 0);

        let key = RecordKey::Int(7);
        let local = SourceTag::Local;
        let id1 = store.append(&row("users", &key, Some(r#"{"id":7}"#), &local, 1_000)).await.unwrap();
        let id2 = store.append(&row("users", &key, None, &local, 2_000)).await.unwrap();

        assert!(id2 > id1);
        assert_eq!(store.pending_count().await.unwrap(), 2);

        store.close().await;
    }

    #[tokio::test]
    async fn test_relabel_fetch_delete_batch() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir, "batch.db").await;

        let key = RecordKey::Int(1);
        let local = SourceTag::Local;
        let other = SourceTag::Batch(BatchId::generate());
        store.append(&row("users", &key, Some(r#"{"id":1,"n":2}"#), &local, 2_000)).await.unwrap();
        store.append(&row("users", &key, Some(r#"{"id":1,"n":1}"#), &local, 1_000)).await.unwrap();
        store.append(&row("users", &key, None, &other, 500)).await.unwrap();

        let batch = BatchId::generate();
        let mut conn = store.pool().acquire().await.unwrap();
        assert_eq!(relabel_local(&mut conn, &batch).await.unwrap(), 2);

        let records = fetch_batch(&mut conn, &batch).await.unwrap();
        assert_eq!(records.len(), 2);
        // ordered by timestamp, not insertion
        assert_eq!(records[0].data, Some(json!({"id": 1, "n": 1})));
        assert_eq!(records[1].data, Some(json!({"id": 1, "n": 2})));
        assert_eq!(records[0].source, SourceTag::Batch(batch.clone()));

        assert_eq!(delete_batch(&mut conn, &batch).await.unwrap(), 2);
        drop(conn);

        assert_eq!(store.count_by_source(&SourceTag::Batch(batch.clone())).await.unwrap(), 0);
        assert_eq!(store.all().await.unwrap().len(), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn test_same_millisecond_keeps_append_order() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir, "ties.db").await;

        let key = RecordKey::Int(1);
        let local = SourceTag::Local;
        for n in 0..5 {
            let data = format!(r#"{{"id":1,"n":{n}}}"#);
            store.append(&row("users", &key, Some(&data), &local, 1_000)).await.unwrap();
        }

        let records = store.all().await.unwrap();
        let ns: Vec<i64> = records
            .iter()
            .map(|r| r.data.as_ref().unwrap()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);

        store.close().await;
    }

    #[tokio::test]
    async fn test_null_and_empty_source_count_as_local() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir, "null_source.db").await;

        sqlx::query(
            "INSERT INTO change_history (table_name, record_id, operation, data, source_id, timestamp) VALUES ('users', '1', 'delete', NULL, NULL, 1), ('users', '2', 'delete', NULL, '', 2)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        assert_eq!(store.pending_count().await.unwrap(), 2);

        let batch = BatchId::generate();
        let mut conn = store.pool().acquire().await.unwrap();
        assert_eq!(relabel_local(&mut conn, &batch).await.unwrap(), 2);
        drop(conn);

        store.close().await;
    }

    #[tokio::test]
    async fn test_unknown_operation_rows_are_skipped_on_read() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir, "unknown_op.db").await;

        sqlx::query(
            "INSERT INTO change_history (table_name, record_id, operation, data, source_id, timestamp) VALUES ('users', '1', 'upsert', NULL, 'local', 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        assert!(store.all().await.unwrap().is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn test_non_json_data_kept_as_string() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir, "raw_data.db").await;

        let key = RecordKey::Int(1);
        let local = SourceTag::Local;
        store.append(&row("users", &key, Some("not json"), &local, 1)).await.unwrap();

        let records = store.all().await.unwrap();
        assert_eq!(records[0].data, Some(json!("not json")));
        store.close().await;
    }

    #[tokio::test]
    async fn test_table_exists() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir, "exists.db").await;

        let mut conn = store.pool().acquire().await.unwrap();
        assert!(table_exists(&mut conn, LOG_TABLE).await.unwrap());
        assert!(!table_exists(&mut conn, "users").await.unwrap());
        drop(conn);

        store.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_store_survives_between_calls() {
        let store = ChangeLogStore::open(&StoreConfig::in_memory()).await.unwrap();
        let key = RecordKey::Int(1);
        let local = SourceTag::Local;
        store.append(&row("users", &key, None, &local, 1)).await.unwrap();
        store.append(&row("users", &key, None, &local, 2)).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 2);
        assert_eq!(store.path(), ":memory:");
    }

    #[tokio::test]
    async fn test_store_reopen_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let config = StoreConfig::at(path.to_str().unwrap());

        {
            let store = ChangeLogStore::open(&config).await.unwrap();
            let key = RecordKey::Int(9);
            let local = SourceTag::Local;
            store.append(&row("users", &key, None, &local, 1)).await.unwrap();
            store.close().await;
        }

        {
            let store = ChangeLogStore::open(&config).await.unwrap();
            assert_eq!(store.pending_count().await.unwrap(), 1);
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }
}
