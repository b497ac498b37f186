// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Export of the unshared tail of the change log.
//!
//! # Algorithm
//!
//! The destination is chosen before any write lock is taken: the save
//! dialog may stay open for minutes, and the application keeps recording
//! changes meanwhile. Everything after that runs in one transaction; the
//! file rename is the commit point that gates the delete.
//!
//! ```text
//! check password ─► count local ─► none? exported = 0
//!                        │
//!                        ▼
//!               pick destination ─► cancelled? exported = 0
//!                        │
//!                        ▼
//! BEGIN ─► relabel local → batch id ─► read batch (timestamp, id)
//!                        │
//!                        ▼
//!        seal ─► write tmp ─► rename ─► delete batch ─► COMMIT
//! ```
//!
//! Changes recorded while the dialog is open are part of the batch. A
//! failure anywhere before the commit rolls the relabel back, so the
//! records are still `local` and the next export picks them up again.

use crate::codec::BatchCodec;
use crate::config::{ExportConfig, SecurityConfig, WeakPasswordPolicy};
use crate::error::{ReplicationError, Result};
use crate::picker::FilePicker;
use crate::record::BatchEntry;
use crate::source::BatchId;
use crate::store::{self, ChangeLogStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Result of one export.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportOutcome {
    /// Records written to the file. Zero when nothing happened.
    pub exported: usize,
    pub path: Option<PathBuf>,
    pub batch_id: Option<BatchId>,
    /// Size of the written file.
    pub bytes: usize,
}

impl ExportOutcome {
    fn nothing() -> Self {
        Self::default()
    }
}

/// Exports local records as one sealed batch file.
pub struct Exporter {
    store: Arc<ChangeLogStore>,
    security: SecurityConfig,
    config: ExportConfig,
}

impl Exporter {
    pub fn new(store: Arc<ChangeLogStore>, security: SecurityConfig, config: ExportConfig) -> Self {
        Self {
            store,
            security,
            config,
        }
    }

    /// Export every local record to a file chosen by `picker`.
    #[instrument(skip_all)]
    pub async fn export(&self, password: &str, picker: &dyn FilePicker) -> Result<ExportOutcome> {
        let start = Instant::now();
        match self.run(password, picker).await {
            Ok(outcome) => {
                if outcome.exported > 0 {
                    crate::metrics::record_export(outcome.exported, outcome.bytes, start.elapsed());
                }
                if let Ok(pending) = self.store.pending_count().await {
                    crate::metrics::set_pending_changes(pending);
                }
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), "Export failed, log left unchanged");
                crate::metrics::record_export_failed(e.code());
                Err(e)
            }
        }
    }

    async fn run(&self, password: &str, picker: &dyn FilePicker) -> Result<ExportOutcome> {
        if !self.security.is_acceptable(password) {
            return match self.security.weak_password_policy {
                WeakPasswordPolicy::NoOp => {
                    warn!(min_len = self.security.min_password_len, "Password too short, nothing exported");
                    crate::metrics::record_export_skipped("weak_password");
                    Ok(ExportOutcome::nothing())
                }
                WeakPasswordPolicy::Reject => Err(ReplicationError::WeakPassword {
                    min_len: self.security.min_password_len,
                }),
            };
        }

        let pending = self.store.pending_count().await?;
        if pending == 0 {
            info!("No local changes to export");
            crate::metrics::record_export_skipped("empty");
            return Ok(ExportOutcome::nothing());
        }

        let Some(path) = picker.save_path(&self.config.default_file_name, &self.config.file_extension) else {
            info!(pending, "Export cancelled, changes stay local");
            crate::metrics::record_export_skipped("cancelled");
            return Ok(ExportOutcome::nothing());
        };

        let batch = BatchId::generate();
        let mut tx = self.store.begin().await?;

        let relabelled = store::relabel_local(&mut tx, &batch).await?;
        let records = store::fetch_batch(&mut tx, &batch).await?;
        debug!(batch_id = %batch, relabelled, count = records.len(), "Export batch assembled");

        // only unknown-operation rows were pending
        if records.is_empty() {
            tx.rollback().await?;
            info!("No exportable changes");
            crate::metrics::record_export_skipped("empty");
            return Ok(ExportOutcome::nothing());
        }

        let entries: Vec<BatchEntry> = records.iter().map(|r| r.to_entry()).collect();
        let sealed = self.seal(entries, password).await?;
        write_atomic(&path, &sealed).await?;

        let deleted = store::delete_batch(&mut tx, &batch).await?;
        tx.commit().await?;

        info!(
            batch_id = %batch,
            count = records.len(),
            deleted,
            bytes = sealed.len(),
            path = %path.display(),
            "Changes exported"
        );

        Ok(ExportOutcome {
            exported: records.len(),
            path: Some(path),
            batch_id: Some(batch),
            bytes: sealed.len(),
        })
    }

    /// Key derivation is CPU-bound; keep it off the async workers.
    async fn seal(&self, entries: Vec<BatchEntry>, password: &str) -> Result<Vec<u8>> {
        let codec = BatchCodec::new(self.security.format, self.security.kdf);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || codec.seal_batch(&entries, &password))
            .await
            .map_err(|e| ReplicationError::Internal(format!("Seal task failed: {e}")))?
    }
}

/// Write to a sibling temp file, flush it, then rename it over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| ReplicationError::Config(format!("Export path has no file name: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| ReplicationError::io(&tmp, e))?;
        file.write_all(bytes).await.map_err(|e| ReplicationError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| ReplicationError::io(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ReplicationError::io(path, e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}
