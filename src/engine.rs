// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine: the operator-facing surface.
//!
//! Ties together:
//! - The change log via [`crate::store::ChangeLogStore`]
//! - Capture via [`crate::recorder::ChangeRecorder`]
//! - "Export changes" via [`crate::exporter::Exporter`]
//! - "Import changes" via [`crate::importer::Importer`]
//!
//! Exports and imports are serialized: at most one runs at a time per
//! engine. Neither holds a write lock while a file dialog is open, so the
//! application can keep recording; once a file is chosen, recording waits
//! on SQLite's busy timeout until the batch commits.

use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::exporter::{ExportOutcome, Exporter};
use crate::importer::{ImportOutcome, Importer};
use crate::picker::{FilePicker, FixedPath};
use crate::recorder::ChangeRecorder;
use crate::store::ChangeLogStore;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// The replication engine.
///
/// Owns the log store; the application shares the same database through
/// [`pool()`](Self::pool) for its own tables.
pub struct ReplicationEngine {
    config: ReplicationConfig,

    store: Arc<ChangeLogStore>,

    recorder: ChangeRecorder,

    exporter: Exporter,

    importer: Importer,

    /// Held for the duration of an export or import
    batch_lock: Mutex<()>,
}

impl ReplicationEngine {
    /// Open the database and wire the components from `config`.
    pub async fn open(config: ReplicationConfig) -> Result<Self> {
        let store = Arc::new(ChangeLogStore::open(&config.store).await?);
        let codecs = Arc::new(config.import.codec_registry());

        let recorder = ChangeRecorder::new(store.clone(), codecs.clone());
        let exporter = Exporter::new(store.clone(), config.security.clone(), config.export.clone());
        let importer = Importer::new(store.clone(), config.security.clone(), config.import.clone(), codecs)
            .with_file_extension(&config.export.file_extension);

        info!(
            path = %config.store.sqlite_path,
            format = ?config.security.format,
            weak_password_policy = ?config.security.weak_password_policy,
            "Replication engine ready"
        );

        Ok(Self {
            config,
            store,
            recorder,
            exporter,
            importer,
            batch_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Handle for the application's write paths.
    pub fn recorder(&self) -> &ChangeRecorder {
        &self.recorder
    }

    pub fn store(&self) -> &ChangeLogStore {
        &self.store
    }

    /// Pool over the application database.
    pub fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    /// Records waiting for the next export.
    pub async fn pending_changes(&self) -> Result<u64> {
        self.store.pending_count().await
    }

    /// "Export changes": seal every local record into the file the picker
    /// chooses.
    pub async fn export_changes(&self, password: &str, picker: &dyn FilePicker) -> Result<ExportOutcome> {
        let _guard = self.batch_lock.lock().await;
        self.exporter.export(password, picker).await
    }

    /// "Import changes": replay the file the picker chooses.
    pub async fn import_changes(&self, password: &str, picker: &dyn FilePicker) -> Result<ImportOutcome> {
        let _guard = self.batch_lock.lock().await;
        self.importer.import(password, picker).await
    }

    pub async fn export_to(&self, password: &str, path: impl AsRef<Path>) -> Result<ExportOutcome> {
        self.export_changes(password, &FixedPath::new(path.as_ref())).await
    }

    pub async fn import_from(&self, password: &str, path: impl AsRef<Path>) -> Result<ImportOutcome> {
        let _guard = self.batch_lock.lock().await;
        self.importer.import_file(path.as_ref(), password).await
    }

    /// Checkpoint and close the database.
    pub async fn close(&self) {
        let _guard = self.batch_lock.lock().await;
        self.store.close().await;
        info!("Replication engine closed");
    }
}
