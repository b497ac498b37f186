// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Only file-level and crypto-level problems are errors. They abort the whole
//! export or import with no partial application. Problems with an individual
//! record inside a batch are never errors; they become
//! [`SkipReason`](crate::importer::SkipReason) values and a `warn!` event.
//!
//! # Error Categories
//!
//! | Error Type | Code | Description |
//! |------------|------|-------------|
//! | `Storage` | `storage` | Local SQLite failure |
//! | `Config` | `config` | Configuration invalid |
//! | `Io` | `io` | Reading or writing the batch file failed |
//! | `Serialization` | `serialization` | Batch JSON could not be produced or parsed |
//! | `WeakPassword` | `weak-password` | Password shorter than the configured minimum |
//! | `InvalidPassword` | `invalid-password` | File could not be authenticated (wrong password, tampered, truncated, bad header) |
//! | `MalformedContainer` | `malformed-container` | Authenticated payload is not a batch array |
//! | `KeyDerivation` | `key-derivation` | Argon2 rejected the parameters |
//! | `Internal` | `internal` | Unexpected internal error |

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that abort an export or import.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// SQLite error in the change log or a replicated table.
    ///
    /// Raised before commit, so the surrounding transaction is rolled back.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading or writing a batch file failed.
    #[error("I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The decrypted batch is not a JSON array of change records, or the
    /// outgoing batch could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Password shorter than the configured minimum.
    ///
    /// Only raised under [`WeakPasswordPolicy::Reject`](crate::config::WeakPasswordPolicy::Reject).
    #[error("Password must be at least {min_len} characters")]
    WeakPassword { min_len: usize },

    /// The file could not be authenticated.
    ///
    /// Either the password is wrong or the file was modified in transit.
    /// The two cases are indistinguishable by construction. A file too short
    /// to hold a tag, or whose header names unusable key derivation
    /// parameters, is reported the same way.
    #[error("Invalid password or tampered file")]
    InvalidPassword,

    /// The file decrypted, but its payload is not a JSON array.
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    /// Argon2 refused the key derivation parameters.
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create an I/O error tagged with the file it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable code for the operator-facing surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Io { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::WeakPassword { .. } => "weak-password",
            Self::InvalidPassword => "invalid-password",
            Self::MalformedContainer(_) => "malformed-container",
            Self::KeyDerivation(_) => "key-derivation",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the error means the file could not be authenticated.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::InvalidPassword)
    }

    /// Check if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) => true, // SQLite busy / locked
            Self::Io { .. } => true,  // media removed, disk full
            Self::Config(_) => false,
            Self::Serialization(_) => false,
            Self::WeakPassword { .. } => false,
            Self::InvalidPassword => false,
            Self::MalformedContainer(_) => false,
            Self::KeyDerivation(_) => false,
            Self::Internal(_) => false,
        }
    }
}
