// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source tags: which batch a change record belongs to.
//!
//! The `source_id` column of the change log carries one of three classes of
//! value:
//!
//! | Column value | Meaning |
//! |--------------|---------|
//! | `NULL` / `"local"` | Created here, never left the machine |
//! | export batch id | Relabelled by an export that has not committed yet |
//! | import batch id | Staged by an import that has not committed yet |
//!
//! Batch ids are 30 lowercase hex characters drawn from the OS RNG. Export and
//! import batch ids are indistinguishable by value; only the operation that
//! minted one knows which it is, and both drain their own tag before commit.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column value marking a record as "mine, not yet shared".
pub const LOCAL: &str = "local";

/// Length of a generated batch id, in hex characters.
pub const BATCH_ID_LEN: usize = 30;

/// Opaque per-batch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Mint a fresh batch id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; BATCH_ID_LEN / 2];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source tag of a change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTag {
    /// Not yet exported.
    Local,
    /// Belongs to an export or import batch.
    Batch(BatchId),
}

impl SourceTag {
    /// Interpret a `source_id` column value.
    ///
    /// `NULL`, the empty string and `"local"` all mean local.
    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            None | Some("") | Some(LOCAL) => SourceTag::Local,
            Some(other) => SourceTag::Batch(BatchId(other.to_string())),
        }
    }

    /// Value written to the `source_id` column.
    pub fn as_column(&self) -> &str {
        match self {
            SourceTag::Local => LOCAL,
            SourceTag::Batch(id) => id.as_str(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SourceTag::Local)
    }
}

impl Default for SourceTag {
    fn default() -> Self {
        SourceTag::Local
    }
}

impl From<BatchId> for SourceTag {
    fn from(id: BatchId) -> Self {
        SourceTag::Batch(id)
    }
}
