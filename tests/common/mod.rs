// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - `Replica`: a database on disk with the application's tables and an
//!   engine over it, plus the application's own write paths
//! - `RecordingPicker`: a file dialog that answers with a fixed path and
//!   remembers what it was asked

#![allow(dead_code)]

use changelog_replication::{FilePicker, NewChange, Operation, ReplicationConfig, ReplicationEngine};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;

/// Application schema shared by every replica.
const SCHEMA: &[&str] = &[
    "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT)",
    "CREATE TABLE user_directives (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        title TEXT,
        period_from TEXT,
        period_to TEXT,
        file TEXT
    )",
];

pub const PASSWORD: &str = "correct horse";

/// One disconnected installation of the application.
pub struct Replica {
    pub dir: TempDir,
    pub engine: ReplicationEngine,
}

impl Replica {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut ReplicationConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("records.db");
        let mut config = ReplicationConfig::for_testing(db.to_str().unwrap());
        adjust(&mut config);

        let engine = ReplicationEngine::open(config).await.unwrap();
        for statement in SCHEMA {
            sqlx::query(statement).execute(engine.pool()).await.unwrap();
        }
        Self { dir, engine }
    }

    /// A path inside this replica's directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    // ─── application write paths: write the row, record the change ───

    pub async fn insert_user(&self, id: i64, name: &str) {
        let mut tx = self.engine.store().begin().await.unwrap();
        sqlx::query("INSERT INTO users (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(&mut *tx)
            .await
            .unwrap();
        self.engine
            .recorder()
            .record_in(
                &mut tx,
                NewChange::new("users", id, Operation::Insert).with_data(json!({"id": id, "name": name})),
            )
            .await;
        tx.commit().await.unwrap();
    }

    pub async fn update_user(&self, id: i64, name: &str) {
        sqlx::query("UPDATE users SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(self.engine.pool())
            .await
            .unwrap();
        self.engine
            .recorder()
            .record(NewChange::new("users", id, Operation::Update).with_data(json!({"id": id, "name": name})))
            .await;
    }

    pub async fn delete_user(&self, id: i64) {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(self.engine.pool())
            .await
            .unwrap();
        self.engine
            .recorder()
            .record(NewChange::new("users", id, Operation::Delete))
            .await;
    }

    /// Seed a row without recording it (state both replicas already share).
    pub async fn seed_user(&self, id: i64, name: &str) {
        sqlx::query("INSERT INTO users (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(self.engine.pool())
            .await
            .unwrap();
    }

    pub async fn users(&self) -> Vec<(i64, String)> {
        sqlx::query_as("SELECT id, name FROM users ORDER BY id")
            .fetch_all(self.engine.pool())
            .await
            .unwrap()
    }

    pub async fn user_name(&self, id: i64) -> Option<String> {
        sqlx::query_scalar("SELECT name FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.engine.pool())
            .await
            .unwrap()
    }

    pub async fn log_len(&self) -> usize {
        self.engine.store().all().await.unwrap().len()
    }
}

/// File dialog stand-in that records the questions it was asked.
pub struct RecordingPicker {
    path: Option<PathBuf>,
    pub save_requests: Mutex<Vec<(String, String)>>,
    pub open_requests: Mutex<Vec<String>>,
}

impl RecordingPicker {
    pub fn answering(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            save_requests: Mutex::new(Vec::new()),
            open_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn cancelling() -> Self {
        Self {
            path: None,
            save_requests: Mutex::new(Vec::new()),
            open_requests: Mutex::new(Vec::new()),
        }
    }
}

impl FilePicker for RecordingPicker {
    fn save_path(&self, default_name: &str, extension: &str) -> Option<PathBuf> {
        self.save_requests
            .lock()
            .unwrap()
            .push((default_name.to_string(), extension.to_string()));
        self.path.clone()
    }

    fn open_path(&self, extension: &str) -> Option<PathBuf> {
        self.open_requests.lock().unwrap().push(extension.to_string());
        self.path.clone()
    }
}
