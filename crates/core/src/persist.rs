//! On-disk book layout with an atomic version switch.
//!
//! ```text
//! {root}/books/{book_id}/
//!     CURRENT                       {"version": "...", "content_hash": "..."}
//!     versions/{version}/
//!         original/{filename}
//!         resources/{book-relative path}
//!         chapters/{index:04}.html
//!         book.html
//!         structure.json            written last
//! ```
//!
//! A version is assembled in a staging directory, renamed into `versions/`,
//! and only then published by replacing `CURRENT`. Readers that resolve
//! `CURRENT` therefore always see a complete layout.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::descriptor::{
    ChapterEntry, OriginalUpload, ResourceEntry, StructureDescriptor, BOOK_FILE, DESCRIPTOR_FILE,
    SCHEMA_VERSION,
};
use crate::error::{PersistError, StoreError};
use crate::id::BookId;
use crate::paths::{safe_join, sanitize_filename};
use crate::stats::reading_minutes;
use crate::structure::SanitizedBook;
use crate::upload::UploadedAsset;

pub const POINTER_FILE: &str = "CURRENT";
const VERSIONS_DIR: &str = "versions";
const STAGING_PREFIX: &str = ".staging-";

/// Content of the `CURRENT` pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub version: String,
    pub content_hash: String,
}

impl CurrentPointer {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn io_error(path: &Path, source: std::io::Error) -> PersistError {
    PersistError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Removes a staging directory unless the version was committed.
struct Staging {
    dir: PathBuf,
    committed: bool,
}

impl Staging {
    /// Write `data` at a layout-relative path. Returns `(size, sha256)`.
    fn write(&self, relative: &str, data: &[u8]) -> Result<(u64, String), PersistError> {
        let path = safe_join(&self.dir, relative)
            .ok_or_else(|| PersistError::UnsafePath(relative.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        fs::write(&path, data).map_err(|e| io_error(&path, e))?;
        Ok((data.len() as u64, sha256_hex(data)))
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                if e.kind() != IoErrorKind::NotFound {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "failed to remove staging directory");
                }
            }
        }
    }
}

/// Filesystem store of per-book versioned layouts.
#[derive(Debug, Clone)]
pub struct BookStore {
    root: PathBuf,
}

impl BookStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn book_dir(&self, book_id: &BookId) -> PathBuf {
        self.root.join("books").join(book_id.as_str())
    }

    pub fn pointer_path(&self, book_id: &BookId) -> PathBuf {
        self.book_dir(book_id).join(POINTER_FILE)
    }

    /// Directory of one version. `None` if `version` is not a plain name.
    pub fn version_dir(&self, book_id: &BookId, version: &str) -> Option<PathBuf> {
        if version.contains('/') || version.starts_with('.') {
            return None;
        }
        safe_join(&self.book_dir(book_id).join(VERSIONS_DIR), version)
    }

    /// Write a complete new version and switch `CURRENT` to it.
    pub fn persist(
        &self,
        book_id: &BookId,
        book: &SanitizedBook,
        aggregate: &str,
        original: &UploadedAsset,
    ) -> Result<StructureDescriptor, PersistError> {
        let versions = self.book_dir(book_id).join(VERSIONS_DIR);
        fs::create_dir_all(&versions).map_err(|e| io_error(&versions, e))?;

        let previous = self.current(book_id).ok().flatten();
        let created_at = unix_now();
        let version = new_version_name();

        let mut staging = Staging {
            dir: versions.join(format!("{STAGING_PREFIX}{version}")),
            committed: false,
        };
        fs::create_dir(&staging.dir).map_err(|e| io_error(&staging.dir, e))?;

        let descriptor =
            self.write_version(&staging, book_id, &version, created_at, book, aggregate, original)?;

        let final_dir = versions.join(&version);
        fs::rename(&staging.dir, &final_dir).map_err(|e| io_error(&final_dir, e))?;
        staging.committed = true;

        let pointer = CurrentPointer {
            version: version.clone(),
            content_hash: descriptor.content_hash.clone(),
        };
        if let Err(e) = self.publish(book_id, &pointer) {
            let _ = fs::remove_dir_all(&final_dir);
            return Err(e);
        }

        tracing::info!(
            book = %book_id,
            version = %version,
            chapters = descriptor.chapters.len(),
            resources = descriptor.resources.len(),
            "layout published"
        );

        let mut keep = vec![version.as_str()];
        if let Some(prev) = &previous {
            keep.push(prev.version.as_str());
        }
        self.collect_garbage(&versions, &keep);

        Ok(descriptor)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_version(
        &self,
        staging: &Staging,
        book_id: &BookId,
        version: &str,
        created_at: u64,
        book: &SanitizedBook,
        aggregate: &str,
        original: &UploadedAsset,
    ) -> Result<StructureDescriptor, PersistError> {
        let original_file = format!("original/{}", sanitize_filename(&original.filename));
        let (size, sha256) = staging.write(&original_file, &original.bytes)?;
        let original = OriginalUpload {
            filename: original.filename.clone(),
            file: original_file,
            media_type: original.media_type.clone(),
            size,
            sha256,
        };

        let mut resources = Vec::with_capacity(book.resources.len());
        for resource in &book.resources {
            let file = format!("resources/{}", resource.path);
            let (size, sha256) = staging.write(&file, &resource.data)?;
            resources.push(ResourceEntry {
                path: resource.path.clone(),
                file,
                media_type: resource.media_type.clone(),
                size,
                sha256,
            });
        }

        let mut chapters = Vec::with_capacity(book.chapters.len());
        for chapter in &book.chapters {
            let file = format!("chapters/{:04}.html", chapter.index);
            let (size, sha256) = staging.write(&file, chapter.content.as_bytes())?;
            chapters.push(ChapterEntry {
                id: chapter.id.clone(),
                index: chapter.index,
                title: chapter.title.clone(),
                anchor: chapter.anchor.clone(),
                file,
                stylesheets: chapter.stylesheets.clone(),
                word_count: chapter.word_count,
                size,
                sha256,
                truncated: chapter.truncated,
            });
        }

        let (_, content_hash) = staging.write(BOOK_FILE, aggregate.as_bytes())?;
        let word_count = book.word_count();

        let descriptor = StructureDescriptor {
            schema_version: SCHEMA_VERSION,
            book_id: book_id.clone(),
            version: version.to_string(),
            source_format: book.source_format,
            content_hash,
            metadata: book.metadata.clone(),
            chapters,
            resources,
            navigation: book.navigation.clone(),
            broken_references: book.broken_references.clone(),
            book_file: BOOK_FILE.to_string(),
            word_count,
            reading_minutes: reading_minutes(word_count),
            original,
            created_at,
        };
        let json = serde_json::to_vec_pretty(&descriptor)?;
        staging.write(DESCRIPTOR_FILE, &json)?;
        Ok(descriptor)
    }

    /// Replace `CURRENT` through a temporary file and rename.
    fn publish(&self, book_id: &BookId, pointer: &CurrentPointer) -> Result<(), PersistError> {
        let target = self.pointer_path(book_id);
        let tmp = self
            .book_dir(book_id)
            .join(format!("{POINTER_FILE}.tmp-{}", uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_vec(pointer)?;
        fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(&target, e));
        }
        Ok(())
    }

    fn collect_garbage(&self, versions: &Path, keep: &[&str]) {
        let Ok(entries) = fs::read_dir(versions) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if keep.contains(&name) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => tracing::debug!(version = name, "removed superseded version"),
                Err(e) => tracing::warn!(version = name, error = %e, "failed to remove version"),
            }
        }
    }

    /// The published pointer, or `None` if the book has never completed.
    pub fn current(&self, book_id: &BookId) -> Result<Option<CurrentPointer>, StoreError> {
        let path = self.pointer_path(book_id);
        match fs::read(&path) {
            Ok(bytes) => CurrentPointer::from_json(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Descriptor {
                    book_id: book_id.to_string(),
                    source,
                }),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Descriptor of the published version.
    pub fn load_descriptor(&self, book_id: &BookId) -> Result<StructureDescriptor, StoreError> {
        let pointer = self
            .current(book_id)?
            .ok_or_else(|| StoreError::Missing(book_id.to_string()))?;
        self.load_descriptor_at(book_id, &pointer.version)
    }

    pub fn load_descriptor_at(
        &self,
        book_id: &BookId,
        version: &str,
    ) -> Result<StructureDescriptor, StoreError> {
        let bytes = self.read_file(book_id, version, DESCRIPTOR_FILE)?;
        StructureDescriptor::from_json(&bytes).map_err(|source| StoreError::Descriptor {
            book_id: book_id.to_string(),
            source,
        })
    }

    /// Read a layout-relative file of one version.
    pub fn read_file(
        &self,
        book_id: &BookId,
        version: &str,
        file: &str,
    ) -> Result<Vec<u8>, StoreError> {
        let path = self
            .version_dir(book_id, version)
            .and_then(|dir| safe_join(&dir, file))
            .ok_or_else(|| StoreError::Missing(book_id.to_string()))?;
        fs::read(&path).map_err(|source| {
            if source.kind() == IoErrorKind::NotFound {
                StoreError::Missing(book_id.to_string())
            } else {
                StoreError::Io {
                    path: path.display().to_string(),
                    source,
                }
            }
        })
    }

    /// Books with a published layout.
    pub fn list_books(&self) -> Vec<BookId> {
        let Ok(entries) = fs::read_dir(self.root.join("books")) else {
            return Vec::new();
        };
        let mut ids: Vec<BookId> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|n| BookId::parse(n).ok()))
            .filter(|id| self.pointer_path(id).is_file())
            .collect();
        ids.sort();
        ids
    }
}

fn new_version_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis:013}-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{BookMetadata, ChapterRecord, ResourceRecord, SourceFormat};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn book(text: &str) -> SanitizedBook {
        SanitizedBook {
            source_format: SourceFormat::Html,
            metadata: BookMetadata {
                title: Some("T".into()),
                ..BookMetadata::default()
            },
            chapters: vec![ChapterRecord {
                id: "chapter-1".into(),
                index: 0,
                title: "T".into(),
                anchor: "chapter-0".into(),
                content: format!("<p>{text}</p>"),
                stylesheets: Vec::new(),
                word_count: 1,
                truncated: false,
            }],
            resources: vec![ResourceRecord {
                path: "img/a.png".into(),
                data: vec![1, 2, 3],
                media_type: "image/png".into(),
            }],
            navigation: Vec::new(),
            broken_references: Vec::new(),
            chapter_base: String::new(),
        }
    }

    fn upload() -> UploadedAsset {
        UploadedAsset {
            filename: "t.html".into(),
            media_type: Some("text/html".into()),
            bytes: b"<p>x</p>".to_vec(),
        }
    }

    fn persist(store: &BookStore, id: &BookId, text: &str) -> StructureDescriptor {
        let b = book(text);
        let aggregate = b.aggregate_document();
        store.persist(id, &b, &aggregate, &upload()).unwrap()
    }

    #[test]
    fn test_persist_writes_complete_layout() {
        let tmp = TempDir::new().unwrap();
        let store = BookStore::new(tmp.path());
        let id = BookId::parse("b1").unwrap();

        let d = persist(&store, &id, "hello");
        let dir = store.version_dir(&id, &d.version).unwrap();
        assert!(dir.join("chapters/0000.html").is_file());
        assert!(dir.join("resources/img/a.png").is_file());
        assert!(dir.join("original/t.html").is_file());
        assert!(dir.join("book.html").is_file());
        assert_eq!(store.load_descriptor(&id).unwrap(), d);

        let book_html = fs::read(dir.join("book.html")).unwrap();
        assert_eq!(d.content_hash, sha256_hex(&book_html));
        assert_eq!(
            store.read_file(&id, &d.version, "chapters/0000.html").unwrap(),
            b"<p>hello</p>"
        );
    }

    #[test]
    fn test_missing_book_reports_missing() {
        let tmp = TempDir::new().unwrap();
        let store = BookStore::new(tmp.path());
        let id = BookId::parse("nope").unwrap();
        assert!(store.current(&id).unwrap().is_none());
        assert!(matches!(store.load_descriptor(&id), Err(StoreError::Missing(_))));
    }

    #[test]
    fn test_reingest_switches_and_keeps_previous() {
        let tmp = TempDir::new().unwrap();
        let store = BookStore::new(tmp.path());
        let id = BookId::parse("b1").unwrap();

        let first = persist(&store, &id, "one");
        let second = persist(&store, &id, "two");
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(store.current(&id).unwrap().unwrap().version, second.version);
        assert!(store.version_dir(&id, &first.version).unwrap().is_dir());

        let third = persist(&store, &id, "three");
        assert!(!store.version_dir(&id, &first.version).unwrap().exists());
        assert!(store.version_dir(&id, &second.version).unwrap().is_dir());
        assert_eq!(store.load_descriptor(&id).unwrap().version, third.version);
    }

    #[test]
    fn test_failed_write_leaves_current_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = BookStore::new(tmp.path());
        let id = BookId::parse("b1").unwrap();
        let first = persist(&store, &id, "one");

        // A file and a directory competing for the same path.
        let mut clash = book("two");
        clash.resources.push(ResourceRecord {
            path: "img/a.png/b.png".into(),
            data: vec![4],
            media_type: "image/png".into(),
        });
        let aggregate = clash.aggregate_document();
        let err = store.persist(&id, &clash, &aggregate, &upload()).unwrap_err();
        assert!(matches!(err, PersistError::Io { .. }), "{err}");

        assert_eq!(store.current(&id).unwrap().unwrap().version, first.version);
        assert_eq!(store.load_descriptor(&id).unwrap(), first);
        let leftovers: Vec<_> = fs::read_dir(store.book_dir(&id).join(VERSIONS_DIR))
            .unwrap()
            .flatten()
            .map(|e| e.file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_version_dir_rejects_traversal() {
        let store = BookStore::new("/srv/books");
        let id = BookId::parse("b1").unwrap();
        assert!(store.version_dir(&id, "../../b2").is_none());
        assert!(store.version_dir(&id, ".staging-x").is_none());
        assert!(store.version_dir(&id, "123-abc").is_some());
    }

    #[test]
    fn test_list_books_only_published() {
        let tmp = TempDir::new().unwrap();
        let store = BookStore::new(tmp.path());
        persist(&store, &BookId::parse("b2").unwrap(), "x");
        persist(&store, &BookId::parse("a1").unwrap(), "y");
        fs::create_dir_all(tmp.path().join("books/empty")).unwrap();
        let ids: Vec<_> = store.list_books().iter().map(|b| b.to_string()).collect();
        assert_eq!(ids, vec!["a1", "b2"]);
    }
}
