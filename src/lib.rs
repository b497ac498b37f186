// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Change-Log Replication
//!
//! Offline ("sneakernet") replication between disconnected instances of the
//! same application.
//!
//! ## Architecture
//!
//! Every local mutation is appended to a change log. An operator exports the
//! unshared tail of that log as one encrypted file, carries it to another
//! machine, and imports it there, where each change is replayed against the
//! local tables.
//!
//! ```text
//! ┌──────────────────────────── replica A ─────────────────────────────┐
//! │  write path ──► ChangeRecorder ──► change_history (ChangeLogStore) │
//! │                                          │                         │
//! │                                   Exporter (relabel, read, delete) │
//! │                                          │                         │
//! │                                   BatchCodec::seal ──► .pmc file   │
//! └──────────────────────────────────────────┼─────────────────────────┘
//!                                            │  (USB stick, email, ...)
//! ┌──────────────────────────── replica B ───┼─────────────────────────┐
//! │                                   BatchCodec::open                 │
//! │                                          │                         │
//! │            Importer (flatten, stage, apply, drain staging)         │
//! │                                          │                         │
//! │                                  target tables                     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Loop Prevention
//!
//! Records are tagged with a source tag ([`source::SourceTag`]). Only records
//! tagged `local` are picked up by an export, and the staging copies an import
//! creates are tagged with the import's own batch id and removed before the
//! import commits, so a received batch is never sent back out.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use changelog_replication::{ReplicationConfig, ReplicationEngine, FixedPath, NewChange, Operation};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> changelog_replication::Result<()> {
//!     let engine = ReplicationEngine::open(ReplicationConfig::default()).await?;
//!
//!     engine
//!         .recorder()
//!         .record(NewChange::new("users", 7, Operation::Update).with_data(json!({"id": 7, "name": "B"})))
//!         .await;
//!
//!     let outcome = engine
//!         .export_changes("correct horse", &FixedPath::new("/media/usb/change_log.pmc"))
//!         .await?;
//!     println!("exported {} changes", outcome.exported);
//!
//!     engine.close().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod metrics;
pub mod picker;
pub mod record;
pub mod recorder;
pub mod source;
pub mod store;
pub mod table_codec;

// Re-exports for convenience
pub use codec::{BatchCodec, ContainerFormat, KdfParams};
pub use config::{ExportConfig, ImportConfig, ReplicationConfig, SecurityConfig, StoreConfig, WeakPasswordPolicy};
pub use engine::ReplicationEngine;
pub use error::{ReplicationError, Result};
pub use exporter::{ExportOutcome, Exporter};
pub use importer::{ImportOutcome, Importer, SkipReason, SkippedRecord};
pub use picker::{Cancelled, FilePicker, FixedPath, InDirectory};
pub use record::{BatchEntry, ChangeRecord, Operation, RecordKey};
pub use recorder::{ChangeRecorder, NewChange};
pub use source::{BatchId, SourceTag};
pub use store::ChangeLogStore;
pub use table_codec::{CodecRegistry, FieldRule, TableCodec};
