//! File-scoped memoisation for handlers.
//!
//! Entries are keyed by (path, handler key) and guarded by the file's
//! version: a hit is only returned while the stored version equals the
//! file's current version, and stores carrying a version that no longer
//! matches the current one are refused.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use burnish_types::path_key;

use crate::error::FileError;
use crate::fs::FileManager;

struct CacheEntry {
    version: String,
    value: serde_json::Value,
}

pub struct FileCache {
    files: Arc<FileManager>,
    entries: Mutex<HashMap<(PathBuf, String), CacheEntry>>,
}

impl FileCache {
    #[must_use]
    pub fn new(files: Arc<FileManager>) -> Self {
        Self {
            files,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A stored value, if one exists for the file's current version.
    pub async fn get_file_cache(&self, path: &Path, key: &str) -> Option<serde_json::Value> {
        let stored_version = {
            let entries = self.entries.lock().expect("cache map poisoned");
            entries
                .get(&(path.to_path_buf(), key.to_string()))
                .map(|e| e.version.clone())?
        };
        let current = self.files.get_version(path).await.ok()?;
        if stored_version != current {
            return None;
        }
        let entries = self.entries.lock().expect("cache map poisoned");
        entries
            .get(&(path.to_path_buf(), key.to_string()))
            .filter(|e| e.version == stored_version)
            .map(|e| e.value.clone())
    }

    /// Store a value computed against `version`. Refused when the file has
    /// moved on since the caller read it.
    pub async fn save_file_cache(
        &self,
        path: &Path,
        version: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), FileError> {
        let current = self.files.get_version(path).await?;
        if version != current {
            return Err(FileError::StaleVersion {
                path: path_key(path),
                offered: version.to_string(),
                current,
            });
        }
        let mut entries = self.entries.lock().expect("cache map poisoned");
        entries.insert(
            (path.to_path_buf(), key.to_string()),
            CacheEntry {
                version: version.to_string(),
                value,
            },
        );
        Ok(())
    }

    /// Drop every entry; used on config updates.
    pub fn clear(&self) {
        self.entries.lock().expect("cache map poisoned").clear();
    }
}
