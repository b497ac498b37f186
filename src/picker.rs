// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Choosing where a batch file is written or read from.
//!
//! The application's save/open dialogs sit behind [`FilePicker`]. Returning
//! `None` means the operator cancelled, which export and import treat as
//! "nothing to do".

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Source of file locations (a desktop dialog, a CLI argument, a test).
pub trait FilePicker: Send + Sync {
    /// Where to write an export. `default_name` is the suggested file name.
    fn save_path(&self, default_name: &str, extension: &str) -> Option<PathBuf>;

    /// Which file to import.
    fn open_path(&self, extension: &str) -> Option<PathBuf>;
}

/// Always answers with the same path.
#[derive(Debug, Clone)]
pub struct FixedPath {
    path: PathBuf,
}

impl FixedPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FilePicker for FixedPath {
    fn save_path(&self, _default_name: &str, _extension: &str) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn open_path(&self, _extension: &str) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

/// A fixed directory, such as a mounted USB stick.
///
/// Saves under the suggested file name and opens the most recently
/// modified file with the requested extension.
#[derive(Debug, Clone)]
pub struct InDirectory {
    dir: PathBuf,
}

impl InDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FilePicker for InDirectory {
    fn save_path(&self, default_name: &str, _extension: &str) -> Option<PathBuf> {
        Some(self.dir.join(default_name))
    }

    fn open_path(&self, extension: &str) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.dir).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == extension))
            .max_by_key(|path| {
                fs::metadata(path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH)
            })
    }
}

/// A dialog the operator always dismisses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cancelled;

impl FilePicker for Cancelled {
    fn save_path(&self, _default_name: &str, _extension: &str) -> Option<PathBuf> {
        None
    }

    fn open_path(&self, _extension: &str) -> Option<PathBuf> {
        None
    }
}
