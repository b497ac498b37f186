// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Change-Log Replication
//!
//! Each test builds two (or three) replicas on temporary SQLite databases,
//! moves a batch file between them and checks table contents and the log.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `round_trip_*` - export on one replica, import on another
//! - `drain_*` - log is empty after every completed batch
//! - `idempotent_*`, `order_*`, `tamper_*` - replay guarantees
//! - `export_*`, `import_*` - operator-surface edge cases

mod common;

use changelog_replication::codec::{BatchCodec, KdfParams, SALTED_HEADER_LEN};
use changelog_replication::{
    ChangeRecorder, ContainerFormat, FilePicker, InDirectory, NewChange, Operation, ReplicationError, SkipReason, SourceTag,
    WeakPasswordPolicy,
};
use common::{RecordingPicker, Replica, PASSWORD};
use serde_json::json;
use sqlx::SqlitePool;
use std::path::PathBuf;
use tokio::runtime::Handle;

// =============================================================================
// Round Trip
// =============================================================================

#[tokio::test]
async fn round_trip_reproduces_table_contents() {
    let a = Replica::new().await;
    let b = Replica::new().await;

    a.insert_user(1, "Ada").await;
    a.insert_user(2, "Brian").await;
    a.update_user(1, "Ada L.").await;
    a.delete_user(2).await;
    a.insert_user(3, "Cleo").await;
    a.update_user(3, "Cleo M.").await;

    let file = a.file("batch.pmc");
    let exported = a.engine.export_to(PASSWORD, &file).await.unwrap();
    assert_eq!(exported.exported, 6);

    let imported = b.engine.import_from(PASSWORD, &file).await.unwrap();
    assert_eq!(imported.total, 6);
    assert_eq!(imported.imported, 6);
    assert!(imported.skipped.is_empty());

    assert_eq!(b.users().await, a.users().await);
    assert_eq!(
        b.users().await,
        vec![(1, "Ada L.".to_string()), (3, "Cleo M.".to_string())]
    );
}

#[tokio::test]
async fn round_trip_through_pickers() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.insert_user(1, "Ada").await;

    let picker = RecordingPicker::answering(a.file("out.pmc"));
    let outcome = a.engine.export_changes(PASSWORD, &picker).await.unwrap();
    assert_eq!(outcome.exported, 1);
    assert_eq!(
        picker.save_requests.lock().unwrap().as_slice(),
        &[("change_log.pmc".to_string(), "pmc".to_string())]
    );

    let picker = RecordingPicker::answering(a.file("out.pmc"));
    let outcome = b.engine.import_changes(PASSWORD, &picker).await.unwrap();
    assert_eq!(outcome.imported, 1);
    assert_eq!(picker.open_requests.lock().unwrap().as_slice(), &["pmc".to_string()]);
    assert_eq!(b.user_name(1).await.as_deref(), Some("Ada"));
}

#[tokio::test]
async fn round_trip_through_shared_directory() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    let usb = tempfile::tempdir().unwrap();
    a.insert_user(2, "Bo").await;

    let exported = a.engine.export_changes(PASSWORD, &InDirectory::new(usb.path())).await.unwrap();
    assert_eq!(exported.path, Some(usb.path().join("change_log.pmc")));

    let imported = b.engine.import_changes(PASSWORD, &InDirectory::new(usb.path())).await.unwrap();
    assert_eq!(imported.imported, 1);
    assert_eq!(b.user_name(2).await.as_deref(), Some("Bo"));
}

#[tokio::test]
async fn round_trip_flattens_directive_payloads() {
    let a = Replica::new().await;
    let b = Replica::new().await;

    a.engine
        .recorder()
        .record(NewChange::new("user_directives", 10, Operation::Insert).with_data(json!({
            "id": 10,
            "user_id": 1,
            "title": "Leave",
            "period": {"from": "2026-03-01", "to": null},
            "file": {"name": "order.pdf", "pages": 2}
        })))
        .await;

    let file = a.file("directives.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();
    let outcome = b.engine.import_from(PASSWORD, &file).await.unwrap();
    assert_eq!(outcome.imported, 1);

    let (from, to, attached): (String, String, String) =
        sqlx::query_as("SELECT period_from, period_to, file FROM user_directives WHERE id = 10")
            .fetch_one(b.engine.pool())
            .await
            .unwrap();
    assert_eq!(from, "2026-03-01");
    assert_eq!(to, "");
    let attached: serde_json::Value = serde_json::from_str(&attached).unwrap();
    assert_eq!(attached["name"], json!("order.pdf"));
}

#[tokio::test]
async fn round_trip_legacy_container_is_readable() {
    let a = Replica::with_config(|c| c.security.format = ContainerFormat::Legacy).await;
    let b = Replica::new().await;
    a.insert_user(4, "Dana").await;

    let file = a.file("legacy.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();

    let outcome = b.engine.import_from(PASSWORD, &file).await.unwrap();
    assert_eq!(outcome.imported, 1);
    assert_eq!(b.user_name(4).await.as_deref(), Some("Dana"));
}

#[tokio::test]
async fn import_accepts_legacy_producer_shapes() {
    let b = Replica::new().await;
    b.seed_user(5, "old").await;

    // string-encoded data, string record ids, text timestamps
    let items = json!([
        {
            "id": 1,
            "table_name": "users",
            "record_id": "5",
            "operation": "update",
            "data": "{\"id\":5,\"name\":\"new\"}",
            "source_id": "3c1f0a9d2b7e4c6a8f1e0d3b5a7c9e",
            "timestamp": "2026-02-01 08:00:00"
        },
        {
            "id": 2,
            "table_name": "users",
            "record_id": 6,
            "operation": "INSERT",
            "data": {"id": 6, "name": "Eve"},
            "source_id": "3c1f0a9d2b7e4c6a8f1e0d3b5a7c9e",
            "timestamp": 1769932800000i64
        }
    ]);
    let codec = BatchCodec::new(ContainerFormat::Legacy, KdfParams::for_testing());
    let sealed = codec.seal(items.to_string().as_bytes(), PASSWORD).unwrap();
    let file = b.file("peer.pmc");
    std::fs::write(&file, sealed).unwrap();

    let outcome = b.engine.import_from(PASSWORD, &file).await.unwrap();
    assert_eq!(outcome.imported, 2);
    assert_eq!(b.users().await, vec![(5, "new".to_string()), (6, "Eve".to_string())]);
}

#[tokio::test]
async fn import_reads_aes_gcm_file_from_existing_install() {
    let b = Replica::new().await;
    let fixture = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/legacy_aes_gcm.pmc");

    let outcome = b.engine.import_from(PASSWORD, fixture).await.unwrap();
    assert_eq!(outcome.imported, 1);
    assert_eq!(b.user_name(12).await.as_deref(), Some("Grace"));
    assert_eq!(b.log_len().await, 0);
}

// =============================================================================
// Drain Invariant / Loop Prevention
// =============================================================================

#[tokio::test]
async fn drain_after_export_and_import() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.insert_user(1, "Ada").await;
    a.insert_user(2, "Brian").await;

    let file = a.file("batch.pmc");
    let exported = a.engine.export_to(PASSWORD, &file).await.unwrap();
    let export_batch = exported.batch_id.unwrap();
    assert_eq!(
        a.engine
            .store()
            .count_by_source(&SourceTag::Batch(export_batch))
            .await
            .unwrap(),
        0
    );
    assert_eq!(a.log_len().await, 0);

    let imported = b.engine.import_from(PASSWORD, &file).await.unwrap();
    let import_batch = imported.batch_id.unwrap();
    assert_eq!(
        b.engine
            .store()
            .count_by_source(&SourceTag::Batch(import_batch))
            .await
            .unwrap(),
        0
    );
    assert_eq!(b.log_len().await, 0);
}

#[tokio::test]
async fn drain_even_when_records_are_skipped() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.insert_user(1, "Ada").await;
    a.engine
        .recorder()
        .record(NewChange::new("invoices", 1, Operation::Insert).with_data(json!({"id": 1})))
        .await;

    let file = a.file("batch.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();

    let outcome = b.engine.import_from(PASSWORD, &file).await.unwrap();
    assert_eq!(outcome.imported, 1);
    assert_eq!(outcome.skipped_for(SkipReason::RejectedTable), 1);
    assert_eq!(b.log_len().await, 0);
}

#[tokio::test]
async fn imported_changes_are_not_exported_again() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.insert_user(1, "Ada").await;

    let file = a.file("a.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();
    b.engine.import_from(PASSWORD, &file).await.unwrap();

    // B has nothing of its own yet
    let back = b.engine.export_to(PASSWORD, b.file("b.pmc")).await.unwrap();
    assert_eq!(back.exported, 0);
    assert!(!b.file("b.pmc").exists());

    // only B's own change goes out
    b.insert_user(2, "Bo").await;
    let back = b.engine.export_to(PASSWORD, b.file("b.pmc")).await.unwrap();
    assert_eq!(back.exported, 1);

    let c = Replica::new().await;
    let outcome = c.engine.import_from(PASSWORD, b.file("b.pmc")).await.unwrap();
    assert_eq!(outcome.total, 1);
    assert_eq!(c.users().await, vec![(2, "Bo".to_string())]);
}

// =============================================================================
// Replay Guarantees
// =============================================================================

#[tokio::test]
async fn idempotent_insert_on_repeated_import() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.insert_user(1, "Ada").await;
    a.insert_user(2, "Brian").await;

    let file = a.file("batch.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();

    let first = b.engine.import_from(PASSWORD, &file).await.unwrap();
    assert_eq!(first.imported, 2);

    let second = b.engine.import_from(PASSWORD, &file).await.unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(second.skipped_for(SkipReason::ApplyConflict), 2);
    assert_eq!(b.users().await.len(), 2);
    assert_eq!(b.log_len().await, 0);
}

#[tokio::test]
async fn order_last_write_wins_scenario() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.seed_user(7, "original").await;
    b.seed_user(7, "original").await;

    a.update_user(7, "A").await;
    a.update_user(7, "B").await;

    let file = a.file("batch.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();
    let outcome = b.engine.import_from(PASSWORD, &file).await.unwrap();

    assert_eq!(outcome.imported, 2);
    assert_eq!(b.user_name(7).await.as_deref(), Some("B"));
}

#[tokio::test]
async fn order_follows_timestamp_not_log_id() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    b.seed_user(7, "original").await;

    // later change logged first
    sqlx::query(
        r#"INSERT INTO change_history (table_name, record_id, operation, data, source_id, timestamp)
           VALUES ('users', '7', 'update', '{"id":7,"name":"t2"}', 'local', 2000),
                  ('users', '7', 'update', '{"id":7,"name":"t1"}', 'local', 1000)"#,
    )
    .execute(a.engine.pool())
    .await
    .unwrap();

    let file = a.file("batch.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();
    b.engine.import_from(PASSWORD, &file).await.unwrap();

    assert_eq!(b.user_name(7).await.as_deref(), Some("t2"));
}

#[tokio::test]
async fn tamper_detection_applies_nothing() {
    let a = Replica::new().await;
    a.insert_user(1, "Ada").await;
    let file = a.file("batch.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();
    let sealed = std::fs::read(&file).unwrap();

    // salt, nonce, tag and ciphertext positions
    let positions = [16, SALTED_HEADER_LEN, SALTED_HEADER_LEN + 12, SALTED_HEADER_LEN + 20, sealed.len() - 1];
    for position in positions {
        let b = Replica::new().await;
        let mut tampered = sealed.clone();
        tampered[position] ^= 0x01;
        let path = b.file("tampered.pmc");
        std::fs::write(&path, &tampered).unwrap();

        let err = b.engine.import_from(PASSWORD, &path).await.unwrap_err();
        assert!(
            matches!(err, ReplicationError::InvalidPassword),
            "byte {position}: {err:?}"
        );
        assert!(b.users().await.is_empty());
        assert_eq!(b.log_len().await, 0);
    }
}

#[tokio::test]
async fn import_with_wrong_password_fails() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.insert_user(1, "Ada").await;
    let file = a.file("batch.pmc");
    a.engine.export_to(PASSWORD, &file).await.unwrap();

    let err = b.engine.import_from("battery staple", &file).await.unwrap_err();
    assert_eq!(err.code(), "invalid-password");
    assert!(b.users().await.is_empty());
}

// =============================================================================
// Operator Surface
// =============================================================================

#[tokio::test]
async fn export_short_password_leaves_log_unchanged() {
    let a = Replica::new().await;
    a.insert_user(1, "Ada").await;
    a.update_user(1, "Ada L.").await;
    let before = a.engine.store().all().await.unwrap();

    let outcome = a.engine.export_to("abc", a.file("batch.pmc")).await.unwrap();

    assert_eq!(outcome.exported, 0);
    assert!(!a.file("batch.pmc").exists());
    assert_eq!(a.engine.store().all().await.unwrap(), before);
}

#[tokio::test]
async fn export_short_password_rejected_when_configured() {
    let a = Replica::with_config(|c| c.security.weak_password_policy = WeakPasswordPolicy::Reject).await;
    a.insert_user(1, "Ada").await;

    let err = a.engine.export_to("abc", a.file("batch.pmc")).await.unwrap_err();
    assert_eq!(err.code(), "weak-password");
    assert_eq!(a.engine.pending_changes().await.unwrap(), 1);
}

#[tokio::test]
async fn export_cancelled_keeps_changes() {
    let a = Replica::new().await;
    a.insert_user(1, "Ada").await;

    let picker = RecordingPicker::cancelling();
    let outcome = a.engine.export_changes(PASSWORD, &picker).await.unwrap();
    assert_eq!(outcome.exported, 0);
    assert_eq!(a.engine.pending_changes().await.unwrap(), 1);
}

/// Save dialog the operator leaves open while the application keeps writing.
struct WritesWhileOpen {
    pool: SqlitePool,
    recorder: ChangeRecorder,
    runtime: Handle,
    path: PathBuf,
}

impl FilePicker for WritesWhileOpen {
    fn save_path(&self, _default_name: &str, _extension: &str) -> Option<PathBuf> {
        tokio::task::block_in_place(|| {
            self.runtime.block_on(async {
                sqlx::query("INSERT INTO users (id, name) VALUES (99, 'Late')")
                    .execute(&self.pool)
                    .await
                    .unwrap();
                self.recorder
                    .record(NewChange::new("users", 99, Operation::Insert).with_data(json!({"id": 99, "name": "Late"})))
                    .await;
            })
        });
        Some(self.path.clone())
    }

    fn open_path(&self, _extension: &str) -> Option<PathBuf> {
        None
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn export_keeps_changes_recorded_while_dialog_is_open() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.insert_user(1, "Ada").await;

    let file = a.file("late.pmc");
    let picker = WritesWhileOpen {
        pool: a.engine.pool().clone(),
        recorder: a.engine.recorder().clone(),
        runtime: Handle::current(),
        path: file.clone(),
    };
    let outcome = a.engine.export_changes(PASSWORD, &picker).await.unwrap();
    assert_eq!(outcome.exported, 2);
    assert_eq!(a.engine.pending_changes().await.unwrap(), 0);

    b.engine.import_from(PASSWORD, &file).await.unwrap();
    assert_eq!(b.users().await, vec![(1, "Ada".to_string()), (99, "Late".to_string())]);
}

#[tokio::test]
async fn import_missing_file_is_io_error() {
    let b = Replica::new().await;
    let err = b.engine.import_from(PASSWORD, b.file("absent.pmc")).await.unwrap_err();
    assert_eq!(err.code(), "io");
}

#[tokio::test]
async fn import_truncated_file_is_rejected() {
    let b = Replica::new().await;
    let path = b.file("short.pmc");
    std::fs::write(&path, [0u8; 10]).unwrap();

    let err = b.engine.import_from(PASSWORD, &path).await.unwrap_err();
    assert!(err.is_authentication_failure());
    assert_eq!(err.code(), "invalid-password");
}

#[tokio::test]
async fn recorder_failure_never_reaches_caller() {
    let a = Replica::new().await;
    a.engine.store().close().await;

    // pool is closed; recording must still return normally
    a.engine
        .recorder()
        .record(NewChange::new("users", 1, Operation::Delete))
        .await;
}
