//! Ingestion pipeline: validate → extract → parse → sanitize → persist.
//!
//! One upload is processed end to end on the calling thread. Every stage
//! returns a `Result`, the first error aborts the run, and the catalog row is
//! marked failed while the previously published layout stays current.

use std::sync::Arc;

use serde::Serialize;

use crate::archive::{extract_archive, DroppedEntry};
use crate::cache::DescriptorCache;
use crate::catalog::{BookCatalog, BookRecord, ProcessingStatus};
use crate::error::{IngestError, ValidateError};
use crate::id::BookId;
use crate::limits::IngestLimits;
use crate::media::decode_text;
use crate::persist::{sha256_hex, unix_now, BookStore};
use crate::progress::{emit_progress, IngestStage, ProgressHandler};
use crate::sanitize::Sanitizer;
use crate::stats::reading_minutes;
use crate::structure::{
    build_structure, BookMetadata, BrokenReference, HtmlDocument, NavNode, PackagedBook,
    SanitizedBook, SourceDocument, SourceFormat,
};
use crate::upload::{check_signature, validate_upload, UploadKind, UploadedAsset};

/// Default URL prefix resources are served under.
pub const DEFAULT_RESOURCE_URL_PREFIX: &str = "/api/books";

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub book_id: BookId,
    pub status: ProcessingStatus,
    pub source_format: SourceFormat,
    pub version: String,
    pub content_hash: String,
    /// The content hash differs from the previously published one.
    pub changed: bool,
    pub chapter_count: usize,
    pub resource_count: usize,
    pub word_count: u64,
    pub reading_minutes: u64,
    pub dropped_entries: Vec<DroppedEntry>,
    pub broken_references: Vec<BrokenReference>,
    pub truncated_chapters: Vec<String>,
}

/// Chapter summary in a dry-run inspection.
#[derive(Debug, Clone, Serialize)]
pub struct InspectedChapter {
    pub id: String,
    pub index: usize,
    pub title: String,
    pub word_count: u64,
    pub truncated: bool,
}

/// What an upload would publish, without touching storage.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub source_format: SourceFormat,
    pub metadata: BookMetadata,
    pub content_hash: String,
    pub chapters: Vec<InspectedChapter>,
    pub resources: Vec<String>,
    pub navigation: Vec<NavNode>,
    pub word_count: u64,
    pub reading_minutes: u64,
    pub dropped_entries: Vec<DroppedEntry>,
    pub broken_references: Vec<BrokenReference>,
}

/// A sanitized book ready for the persister.
struct Prepared {
    book: SanitizedBook,
    aggregate: String,
    dropped: Vec<DroppedEntry>,
}

pub struct Ingestor {
    store: BookStore,
    catalog: Arc<dyn BookCatalog>,
    limits: IngestLimits,
    cache: Option<Arc<DescriptorCache>>,
    resource_url_prefix: String,
}

impl Ingestor {
    pub fn new(store: BookStore, catalog: Arc<dyn BookCatalog>, limits: IngestLimits) -> Self {
        Self {
            store,
            catalog,
            limits,
            cache: None,
            resource_url_prefix: DEFAULT_RESOURCE_URL_PREFIX.to_string(),
        }
    }

    /// Invalidate this cache whenever a book is re-published.
    pub fn with_cache(mut self, cache: Arc<DescriptorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_resource_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.resource_url_prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn store(&self) -> &BookStore {
        &self.store
    }

    pub fn limits(&self) -> &IngestLimits {
        &self.limits
    }

    /// Run the whole pipeline for one upload and publish the result.
    pub fn ingest(
        &self,
        book_id: &BookId,
        upload: UploadedAsset,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<IngestReport, IngestError> {
        let previous = self.catalog.get(book_id)?;
        let pending = BookRecord::pending(book_id.clone(), previous.as_ref(), unix_now());
        self.catalog.record(pending.clone())?;

        match self.run(book_id, &upload, previous.as_ref(), progress) {
            Ok(report) => Ok(report),
            Err(err) => {
                tracing::warn!(
                    book = %book_id,
                    file = %upload.filename,
                    kind = err.kind().as_str(),
                    error = %err,
                    "ingestion failed"
                );
                let failed = BookRecord::failed(&pending, err.kind(), err.to_string(), unix_now());
                if let Err(e) = self.catalog.record(failed) {
                    tracing::warn!(book = %book_id, error = %e, "could not record failure");
                }
                Err(err)
            }
        }
    }

    /// Validate, extract, parse and sanitize an upload without persisting it.
    pub fn inspect(
        &self,
        book_id: &BookId,
        upload: &UploadedAsset,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<Inspection, IngestError> {
        let Prepared {
            book,
            aggregate,
            dropped,
        } = self.prepare(book_id, upload, progress)?;
        let word_count = book.word_count();
        Ok(Inspection {
            source_format: book.source_format,
            metadata: book.metadata,
            content_hash: sha256_hex(aggregate.as_bytes()),
            chapters: book
                .chapters
                .iter()
                .map(|c| InspectedChapter {
                    id: c.id.clone(),
                    index: c.index,
                    title: c.title.clone(),
                    word_count: c.word_count,
                    truncated: c.truncated,
                })
                .collect(),
            resources: book.resources.iter().map(|r| r.path.clone()).collect(),
            navigation: book.navigation,
            word_count,
            reading_minutes: reading_minutes(word_count),
            dropped_entries: dropped,
            broken_references: book.broken_references,
        })
    }

    fn run(
        &self,
        book_id: &BookId,
        upload: &UploadedAsset,
        previous: Option<&BookRecord>,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<IngestReport, IngestError> {
        let Prepared {
            book,
            aggregate,
            dropped,
        } = self.prepare(book_id, upload, progress)?;

        emit_progress(progress, IngestStage::Persisting, None);
        let descriptor = self.store.persist(book_id, &book, &aggregate, upload)?;

        let changed = previous.and_then(|p| p.content_hash.as_deref())
            != Some(descriptor.content_hash.as_str());
        if let Some(cache) = &self.cache {
            cache.invalidate(book_id);
        }
        // CURRENT already points at the new layout; a catalog failure from
        // here on must not be reported as a failed ingestion.
        if let Err(e) = self.catalog.record(BookRecord {
            book_id: book_id.clone(),
            source_format: Some(descriptor.source_format),
            status: ProcessingStatus::Completed,
            content_hash: Some(descriptor.content_hash.clone()),
            chapter_count: descriptor.chapters.len() as u64,
            word_count: descriptor.word_count,
            error_kind: None,
            error: None,
            updated_at: unix_now(),
        }) {
            tracing::warn!(book = %book_id, error = %e, "published but could not record completion");
        }

        tracing::info!(
            book = %book_id,
            version = %descriptor.version,
            format = descriptor.source_format.as_str(),
            chapters = descriptor.chapters.len(),
            changed,
            "ingestion completed"
        );

        Ok(IngestReport {
            book_id: book_id.clone(),
            status: ProcessingStatus::Completed,
            source_format: descriptor.source_format,
            version: descriptor.version.clone(),
            content_hash: descriptor.content_hash.clone(),
            changed,
            chapter_count: descriptor.chapters.len(),
            resource_count: descriptor.resources.len(),
            word_count: descriptor.word_count,
            reading_minutes: descriptor.reading_minutes,
            dropped_entries: dropped,
            broken_references: descriptor.broken_references.clone(),
            truncated_chapters: descriptor
                .chapters
                .iter()
                .filter(|c| c.truncated)
                .map(|c| c.id.clone())
                .collect(),
        })
    }

    fn prepare(
        &self,
        book_id: &BookId,
        upload: &UploadedAsset,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<Prepared, IngestError> {
        emit_progress(progress, IngestStage::Validating, Some(&upload.filename));
        let kind = validate_upload(&upload.declaration(), &self.limits)?;
        check_signature(kind, &upload.bytes)?;

        emit_progress(progress, IngestStage::Extracting, None);
        let (source, dropped) = self.open_source(kind, upload)?;

        emit_progress(progress, IngestStage::Parsing, None);
        let structure = build_structure(source)?;

        emit_progress(progress, IngestStage::Sanitizing, None);
        let book_base = format!("{}/{}", self.resource_url_prefix, book_id);
        let book = structure.sanitize(&Sanitizer::for_chapters(&self.limits), &book_base)?;
        for broken in &book.broken_references {
            tracing::warn!(
                book = %book_id,
                chapter = %broken.chapter_id,
                reference = %broken.reference,
                reason = %broken.reason,
                "broken reference removed"
            );
        }
        let aggregate = Sanitizer::for_document(&self.limits).sanitize(&book.aggregate_document())?;

        Ok(Prepared {
            book,
            aggregate,
            dropped,
        })
    }

    fn open_source(
        &self,
        kind: UploadKind,
        upload: &UploadedAsset,
    ) -> Result<(SourceDocument, Vec<DroppedEntry>), IngestError> {
        match kind {
            UploadKind::Packaged => {
                let archive = extract_archive(&upload.bytes, &self.limits)?;
                let dropped = archive.dropped.clone();
                Ok((SourceDocument::Packaged(PackagedBook::open(archive)?), dropped))
            }
            UploadKind::HtmlBundle => {
                let archive = extract_archive(&upload.bytes, &self.limits)?;
                let dropped = archive.dropped.clone();
                Ok((SourceDocument::Html(HtmlDocument::from_bundle(archive)?), dropped))
            }
            UploadKind::Html => {
                let markup = text_of(upload)?;
                Ok((
                    SourceDocument::Html(HtmlDocument::from_markup(&upload.filename, markup)),
                    Vec::new(),
                ))
            }
            UploadKind::PlainText => {
                let text = text_of(upload)?;
                Ok((
                    SourceDocument::Html(HtmlDocument::from_plain_text(&upload.filename, text)),
                    Vec::new(),
                ))
            }
        }
    }
}

fn text_of(upload: &UploadedAsset) -> Result<&str, ValidateError> {
    decode_text(&upload.bytes).ok_or(ValidateError::BadSignature {
        expected: "UTF-8 text",
    })
}
