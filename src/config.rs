// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationEngine::open()`](crate::ReplicationEngine::open)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use changelog_replication::config::{ReplicationConfig, StoreConfig};
//!
//! let config = ReplicationConfig {
//!     store: StoreConfig::at("/var/lib/app/records.db"),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── store: StoreConfig          # SQLite database holding log + tables
//! ├── security: SecurityConfig    # password policy, container format, KDF
//! ├── export: ExportConfig        # default file name / extension
//! └── import: ImportConfig        # primary key, allow-list, table codecs
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! store:
//!   sqlite_path: "/var/lib/app/records.db"
//!   busy_timeout: "5s"
//!
//! security:
//!   min_password_len: 8
//!   weak_password_policy: reject
//!
//! import:
//!   allowed_tables: ["users", "user_history", "user_directives"]
//! ```

use crate::codec::{ContainerFormat, KdfParams};
use crate::table_codec::{default_table_codecs, CodecRegistry, TableCodec};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top-level config object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

impl ReplicationConfig {
    /// Config for tests: given database path, cheap key derivation.
    pub fn for_testing(sqlite_path: &str) -> Self {
        Self {
            store: StoreConfig::at(sqlite_path),
            security: SecurityConfig::for_testing(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: the local SQLite database
// ═══════════════════════════════════════════════════════════════════════════════

/// Local database settings.
///
/// The change log lives in the same database as the tables it replicates, so
/// an import can apply rows and drain its staging records in one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database. `":memory:"` is allowed for tests.
    pub sqlite_path: String,

    /// Whether to use WAL mode (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How long SQLite waits on a locked database before returning busy,
    /// as a duration string (e.g. "5s").
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,
}

fn default_true() -> bool {
    true
}

fn default_busy_timeout() -> String {
    "5s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "records.db".to_string(),
            wal_mode: true,
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn at(path: &str) -> Self {
        Self {
            sqlite_path: path.to_string(),
            ..Default::default()
        }
    }

    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            busy_timeout: default_busy_timeout(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }

    /// Parse the busy_timeout string to a Duration.
    pub fn busy_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.busy_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SecurityConfig: password policy and container format
// ═══════════════════════════════════════════════════════════════════════════════

/// What to do when the operator's password is shorter than the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeakPasswordPolicy {
    /// Report zero records and touch nothing.
    #[default]
    NoOp,
    /// Fail with [`ReplicationError::WeakPassword`](crate::ReplicationError::WeakPassword).
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Minimum password length, in characters.
    #[serde(default = "default_min_password_len")]
    pub min_password_len: usize,

    #[serde(default)]
    pub weak_password_policy: WeakPasswordPolicy,

    /// Container written by exports. Imports accept both formats.
    #[serde(default)]
    pub format: ContainerFormat,

    /// Argon2id cost for the salted format.
    #[serde(default)]
    pub kdf: KdfParams,
}

fn default_min_password_len() -> usize {
    4
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            min_password_len: 4,
            weak_password_policy: WeakPasswordPolicy::NoOp,
            format: ContainerFormat::Salted,
            kdf: KdfParams::default(),
        }
    }
}

impl SecurityConfig {
    /// Minimal Argon2 cost so tests stay fast.
    pub fn for_testing() -> Self {
        Self {
            kdf: KdfParams::for_testing(),
            ..Default::default()
        }
    }

    /// Whether a password meets the minimum length.
    pub fn is_acceptable(&self, password: &str) -> bool {
        password.chars().count() >= self.min_password_len
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ExportConfig / ImportConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Suggested file name for the save dialog.
    #[serde(default = "default_file_name")]
    pub default_file_name: String,

    /// Extension offered by the save/open dialogs.
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
}

fn default_file_name() -> String {
    "change_log.pmc".to_string()
}

fn default_file_extension() -> String {
    "pmc".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_file_name: default_file_name(),
            file_extension: default_file_extension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Primary key column used when a table has no codec override.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Tables a peer file may write to. `None` allows any existing table
    /// except the change log itself.
    #[serde(default)]
    pub allowed_tables: Option<Vec<String>>,

    /// Per-table field mapping.
    #[serde(default = "default_table_codecs")]
    pub tables: Vec<TableCodec>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            primary_key: default_primary_key(),
            allowed_tables: None,
            tables: default_table_codecs(),
        }
    }
}

impl ImportConfig {
    /// Build the codec registry shared by recorder and importer.
    pub fn codec_registry(&self) -> CodecRegistry {
        CodecRegistry::new(&self.primary_key, self.tables.iter().cloned())
    }

    /// Whether a table is on the allow-list (always true without one).
    pub fn is_table_allowed(&self, table: &str) -> bool {
        self.allowed_tables
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|t| t == table))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
