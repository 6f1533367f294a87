//! Shared-file catalog interface and in-memory implementation

use super::StorageError;
use crate::crypto::Fingerprint;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A file this peer is sharing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFile {
    /// Content fingerprint
    pub fingerprint: Fingerprint,

    /// Path to the backing file on disk
    pub path: PathBuf,

    /// Display filename
    pub filename: String,

    /// Size in bytes
    pub size: u64,

    /// When the file was added to the catalog
    pub added_at: DateTime<Utc>,
}

/// Catalog store boundary. Implementations may persist to disk; the
/// in-memory variant below is the default.
pub trait SharedCatalog: Send + Sync {
    /// Add (or refresh) a shared file. Re-adding the same fingerprint
    /// replaces the entry and is not an error.
    fn add(&self, file: SharedFile) -> Result<(), StorageError>;

    /// Look up a shared file by fingerprint.
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<SharedFile>;

    /// List all shared files.
    fn list(&self) -> Vec<SharedFile>;

    /// Remove a shared file, returning the removed entry if any.
    fn remove(&self, fingerprint: &Fingerprint) -> Option<SharedFile>;
}

/// In-memory catalog guarded by a reader/writer lock.
#[derive(Default)]
pub struct MemoryCatalog {
    files: RwLock<HashMap<Fingerprint, SharedFile>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedCatalog for MemoryCatalog {
    fn add(&self, file: SharedFile) -> Result<(), StorageError> {
        self.files.write().insert(file.fingerprint, file);
        Ok(())
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Option<SharedFile> {
        self.files.read().get(fingerprint).cloned()
    }

    fn list(&self) -> Vec<SharedFile> {
        let mut files: Vec<SharedFile> = self.files.read().values().cloned().collect();
        files.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        files
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Option<SharedFile> {
        self.files.write().remove(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(data: &[u8], name: &str) -> SharedFile {
        SharedFile {
            fingerprint: Fingerprint::hash(data),
            path: PathBuf::from(format!("/tmp/{name}")),
            filename: name.to_string(),
            size: data.len() as u64,
            added_at: Utc::now(),
        }
    }

    #[test]
    fn test_add_lookup_remove() {
        let catalog = MemoryCatalog::new();
        let file = entry(b"content", "report.pdf");
        let fp = file.fingerprint;

        catalog.add(file).unwrap();
        assert_eq!(catalog.lookup(&fp).unwrap().filename, "report.pdf");
        assert_eq!(catalog.list().len(), 1);

        assert!(catalog.remove(&fp).is_some());
        assert!(catalog.lookup(&fp).is_none());
        assert!(catalog.remove(&fp).is_none());
    }

    #[test]
    fn test_readd_replaces_entry() {
        let catalog = MemoryCatalog::new();
        let mut file = entry(b"same bytes", "old-name");
        let fp = file.fingerprint;

        catalog.add(file.clone()).unwrap();
        file.filename = "new-name".to_string();
        catalog.add(file).unwrap();

        assert_eq!(catalog.list().len(), 1);
        assert_eq!(catalog.lookup(&fp).unwrap().filename, "new-name");
    }
}
