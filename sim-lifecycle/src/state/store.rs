//! Lock-protected persistence of the lifecycle document

use super::document::LifecycleDocument;
use crate::config::Layout;
use crate::types::{LifecycleError, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Exclusive lock held for the duration of one mutating operation
///
/// The lock file is removed when the guard is dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Create the lock file with create-exclusive semantics
    pub fn acquire(path: &Path) -> Result<Self> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let payload = serde_json::json!({
                    "pid": std::process::id(),
                    "acquired_at": Utc::now().to_rfc3339(),
                });
                if let Err(e) = writeln!(file, "{}", payload).and_then(|_| file.sync_all()) {
                    log::warn!("Failed to write lock payload {:?}: {}", path, e);
                }
                log::debug!("Acquired lock {:?}", path);
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                log::error!("Lockfile exists: {:?}", path);
                Err(LifecycleError::LockHeld(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove lock {:?}: {}", self.path, e);
        } else {
            log::debug!("Released lock {:?}", self.path);
        }
    }
}

/// Diagnostic payload written when an operation fails
#[derive(Debug, Serialize)]
struct Diagnostics<'a> {
    error_kind: &'a str,
    message: String,
    written_at: String,
    document: &'a LifecycleDocument,
}

/// Loads, locks and persists the lifecycle document of one working directory
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    layout: Layout,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn path(&self) -> PathBuf {
        self.layout.state_path(&self.root)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Read and validate the document
    pub fn load(&self) -> Result<LifecycleDocument> {
        let path = self.path();
        log::debug!("Loading state from {:?}", path);
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                LifecycleError::InvalidState(format!(
                    "State file {:?} not found, directory is not initialized",
                    path
                ))
            } else {
                LifecycleError::IoError(e)
            }
        })?;
        let document: LifecycleDocument = serde_json::from_str(&content)?;
        document.validate()?;
        Ok(document)
    }

    /// Persist the full document (pretty-printed, atomic overwrite)
    pub fn save(&self, document: &LifecycleDocument) -> Result<()> {
        atomic_write_json_pretty(&self.path(), document)
    }

    /// Run one mutating operation under the document's lock
    ///
    /// The document is written back only when `operation` succeeds. On failure
    /// the in-memory document and the error are dumped to `<tag>.diag.json`
    /// (best effort) and the on-disk document is left untouched.
    pub fn transaction<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut LifecycleDocument) -> Result<T>,
    {
        let tag = self.load()?.tag;
        let _lock = LockGuard::acquire(&self.layout.lock_path(&self.root, tag))?;

        // Reload under the lock so a racing writer's result is not lost
        let mut document = self.load()?;

        match operation(&mut document) {
            Ok(value) => {
                if let Err(e) = document.validate() {
                    log::error!("Refusing to save an inconsistent document: {}", e);
                    self.write_diagnostics(&document, &e);
                    return Err(e);
                }
                self.save(&document)?;
                log::debug!("State saved to {:?}", self.path());
                Ok(value)
            }
            Err(e) => {
                log::error!("Operation failed: {}", e);
                self.write_diagnostics(&document, &e);
                Err(e)
            }
        }
    }

    /// Best-effort dump of the in-memory document next to the state file
    pub fn write_diagnostics(&self, document: &LifecycleDocument, error: &LifecycleError) {
        let path = self.layout.diag_path(&self.root, document.tag);
        let diagnostics = Diagnostics {
            error_kind: error.kind(),
            message: error.to_string(),
            written_at: Utc::now().to_rfc3339(),
            document,
        };
        match atomic_write_json_pretty(&path, &diagnostics) {
            Ok(()) => log::info!("Diagnostics written to {:?}", path),
            Err(e) => log::warn!("Failed to write diagnostics {:?}: {}", path, e),
        }
    }
}

/// Write bytes through a temporary sibling file and rename it into place
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::document::{Phase, Timeline};
    use crate::types::{LifecycleState, RestartMode};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store_with_document() -> (TempDir, StateStore, LifecycleDocument) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path(), Layout::default());
        let mut doc = LifecycleDocument::new(42, RestartMode::Multiple, BTreeMap::new());
        doc.state = LifecycleState::Started;
        doc.set_timeline(Timeline::new(vec![
            Phase::new("START", 0, Some(0)),
            Phase::new("A", 0, Some(1000)),
        ]));
        store.save(&doc).unwrap();
        (dir, store, doc)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store, doc) = store_with_document();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_load_missing_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path(), Layout::default());
        assert!(matches!(store.load(), Err(LifecycleError::InvalidState(_))));
    }

    #[test]
    fn test_transaction_persists_on_success() {
        let (dir, store, _) = store_with_document();
        let count = store
            .transaction(|doc| {
                doc.restart_count += 1;
                Ok(doc.restart_count)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.load().unwrap().restart_count, 1);
        assert!(!dir.path().join("42.lock").exists());
    }

    #[test]
    fn test_transaction_failure_leaves_document() {
        let (dir, store, doc) = store_with_document();
        let result: Result<()> = store.transaction(|d| {
            d.restart_count = 99;
            Err(LifecycleError::TestRunFailed("job 7 failed".to_string()))
        });
        assert!(matches!(result, Err(LifecycleError::TestRunFailed(_))));
        assert_eq!(store.load().unwrap(), doc);
        assert!(!dir.path().join("42.lock").exists());

        let diag = fs::read_to_string(dir.path().join("42.diag.json")).unwrap();
        assert!(diag.contains("TestRunFailed"));
        assert!(diag.contains("\"restart_count\": 99"));
    }

    #[test]
    fn test_lock_held_does_not_mutate() {
        let (dir, store, doc) = store_with_document();
        let _held = LockGuard::acquire(&dir.path().join("42.lock")).unwrap();

        let result = store.transaction(|d| {
            d.restart_count += 1;
            Ok(())
        });
        assert!(matches!(result, Err(LifecycleError::LockHeld(_))));
        assert_eq!(store.load().unwrap(), doc);
        assert!(dir.path().join("42.lock").exists());
    }

    #[test]
    fn test_lock_payload_is_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("7.lock");
        let guard = LockGuard::acquire(&path).unwrap();
        let payload: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(payload["pid"], serde_json::json!(std::process::id()));
        assert!(payload["acquired_at"].is_string());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_transaction_refuses_inconsistent_timeline() {
        let (dir, store, doc) = store_with_document();
        let result = store.transaction(|d| {
            d.timeline.phases_mut()[1].begin_step = 300;
            Ok(())
        });
        assert!(matches!(result, Err(LifecycleError::InconsistentTimeline(_))));
        assert_eq!(store.load().unwrap(), doc);
        assert!(dir.path().join("42.diag.json").exists());
    }
}
