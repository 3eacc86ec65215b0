//! Relational-style metadata rows, one per book.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, ErrorKind};
use crate::id::BookId;
use crate::structure::SourceFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Completed,
    Failed,
}

/// Catalog row for a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRecord {
    pub book_id: BookId,
    pub source_format: Option<SourceFormat>,
    pub status: ProcessingStatus,
    /// Hash of the published layout. Kept across failed re-ingestions.
    pub content_hash: Option<String>,
    pub chapter_count: u64,
    pub word_count: u64,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub updated_at: u64,
}

impl BookRecord {
    pub fn pending(book_id: BookId, previous: Option<&BookRecord>, now: u64) -> Self {
        let mut record = match previous {
            Some(prev) => prev.clone(),
            None => Self {
                book_id: book_id.clone(),
                source_format: None,
                status: ProcessingStatus::Pending,
                content_hash: None,
                chapter_count: 0,
                word_count: 0,
                error_kind: None,
                error: None,
                updated_at: now,
            },
        };
        record.book_id = book_id;
        record.status = ProcessingStatus::Pending;
        record.error_kind = None;
        record.error = None;
        record.updated_at = now;
        record
    }

    /// Failed row that still describes the last published layout.
    pub fn failed(pending: &BookRecord, kind: ErrorKind, message: String, now: u64) -> Self {
        Self {
            status: ProcessingStatus::Failed,
            error_kind: Some(kind),
            error: Some(message),
            updated_at: now,
            ..pending.clone()
        }
    }
}

/// Storage for catalog rows. Last writer wins.
pub trait BookCatalog: Send + Sync {
    fn record(&self, record: BookRecord) -> Result<(), CatalogError>;
    fn get(&self, book_id: &BookId) -> Result<Option<BookRecord>, CatalogError>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    rows: Mutex<BTreeMap<BookId, BookRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BookCatalog for MemoryCatalog {
    fn record(&self, record: BookRecord) -> Result<(), CatalogError> {
        let mut rows = self.rows.lock().map_err(|_| CatalogError::Poisoned)?;
        rows.insert(record.book_id.clone(), record);
        Ok(())
    }

    fn get(&self, book_id: &BookId) -> Result<Option<BookRecord>, CatalogError> {
        let rows = self.rows.lock().map_err(|_| CatalogError::Poisoned)?;
        Ok(rows.get(book_id).cloned())
    }
}

/// Catalog persisted as one JSON file, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonCatalog {
    pub const FILE_NAME: &'static str = "catalog.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Catalog file under a storage root.
    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<BookId, BookRecord>, CatalogError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, rows: &BTreeMap<BookId, BookRecord>) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec_pretty(rows)?)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl BookCatalog for JsonCatalog {
    fn record(&self, record: BookRecord) -> Result<(), CatalogError> {
        let _guard = self.lock.lock().map_err(|_| CatalogError::Poisoned)?;
        let mut rows = self.load()?;
        rows.insert(record.book_id.clone(), record);
        self.store(&rows)
    }

    fn get(&self, book_id: &BookId) -> Result<Option<BookRecord>, CatalogError> {
        let _guard = self.lock.lock().map_err(|_| CatalogError::Poisoned)?;
        Ok(self.load()?.remove(book_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn completed(id: &str, hash: &str) -> BookRecord {
        BookRecord {
            book_id: BookId::parse(id).unwrap(),
            source_format: Some(SourceFormat::Packaged),
            status: ProcessingStatus::Completed,
            content_hash: Some(hash.to_string()),
            chapter_count: 3,
            word_count: 900,
            error_kind: None,
            error: None,
            updated_at: 10,
        }
    }

    #[test]
    fn test_failure_keeps_previous_hash() {
        let prev = completed("b1", "h1");
        let pending = BookRecord::pending(prev.book_id.clone(), Some(&prev), 20);
        assert_eq!(pending.status, ProcessingStatus::Pending);
        assert_eq!(pending.content_hash.as_deref(), Some("h1"));

        let failed = BookRecord::failed(&pending, ErrorKind::UnsafeArchive, "bad".into(), 21);
        assert_eq!(failed.status, ProcessingStatus::Failed);
        assert_eq!(failed.content_hash.as_deref(), Some("h1"));
        assert_eq!(failed.source_format, Some(SourceFormat::Packaged));
        assert_eq!(failed.error_kind, Some(ErrorKind::UnsafeArchive));
    }

    #[test]
    fn test_memory_catalog_last_writer_wins() {
        let catalog = MemoryCatalog::new();
        catalog.record(completed("b1", "h1")).unwrap();
        catalog.record(completed("b1", "h2")).unwrap();
        let row = catalog.get(&BookId::parse("b1").unwrap()).unwrap().unwrap();
        assert_eq!(row.content_hash.as_deref(), Some("h2"));
        assert!(catalog.get(&BookId::parse("b2").unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_json_catalog_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let catalog = JsonCatalog::in_root(tmp.path());
        catalog.record(completed("b1", "h1")).unwrap();
        catalog.record(completed("b2", "h2")).unwrap();

        let reopened = JsonCatalog::in_root(tmp.path());
        let row = reopened.get(&BookId::parse("b2").unwrap()).unwrap().unwrap();
        assert_eq!(row, completed("b2", "h2"));

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(reopened.path()).unwrap()).unwrap();
        assert_eq!(json["b1"]["status"], "completed");
    }
}
