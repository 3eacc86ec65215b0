//! Entitlement-gated reads of published layouts.

use std::io::ErrorKind as IoErrorKind;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::DescriptorCache;
use crate::descriptor::{StructureDescriptor, TableOfContents, DESCRIPTOR_FILE};
use crate::entitlement::EntitlementCheck;
use crate::error::{ServeError, StoreError};
use crate::id::{BookId, UserId};
use crate::paths::safe_join;
use crate::persist::{BookStore, CurrentPointer};

pub const CACHE_CONTROL: &str = "private, no-cache";
pub const CHAPTER_MEDIA_TYPE: &str = "text/html; charset=utf-8";
pub const TOC_MEDIA_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    EntitlementChecked,
    Resolved,
    Streamed,
    Rejected,
    NotFound,
}

/// Logs each state transition of one read request.
struct RequestTrace<'a> {
    what: &'static str,
    book: &'a BookId,
    state: RequestState,
}

impl<'a> RequestTrace<'a> {
    fn start(what: &'static str, book: &'a BookId) -> Self {
        tracing::debug!(what, book = %book, state = ?RequestState::Received, "read request");
        Self {
            what,
            book,
            state: RequestState::Received,
        }
    }

    fn advance(&mut self, state: RequestState) {
        tracing::debug!(what = self.what, book = %self.book, from = ?self.state, to = ?state, "read request");
        self.state = state;
    }

    /// Record a failure state and pass the error through.
    fn fail(&mut self, err: ServeError) -> ServeError {
        let state = match err {
            ServeError::Forbidden { .. } => RequestState::Rejected,
            _ => RequestState::NotFound,
        };
        self.advance(state);
        err
    }
}

/// A payload ready to stream, with its validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served<T> {
    pub body: T,
    pub media_type: String,
    /// Strong, quoted entity tag.
    pub etag: String,
}

pub struct ContentServer {
    store: BookStore,
    entitlements: Arc<dyn EntitlementCheck>,
    cache: Arc<DescriptorCache>,
    entitlement_timeout: Duration,
}

impl ContentServer {
    pub fn new(
        store: BookStore,
        entitlements: Arc<dyn EntitlementCheck>,
        cache: Arc<DescriptorCache>,
        entitlement_timeout: Duration,
    ) -> Self {
        Self {
            store,
            entitlements,
            cache,
            entitlement_timeout,
        }
    }

    pub fn store(&self) -> &BookStore {
        &self.store
    }

    pub async fn table_of_contents(
        &self,
        user: &UserId,
        book: &BookId,
    ) -> Result<Served<TableOfContents>, ServeError> {
        let mut trace = RequestTrace::start("toc", book);
        self.authorize(&mut trace, user, book).await?;
        let descriptor = self.descriptor(book).await.map_err(|e| trace.fail(e))?;
        trace.advance(RequestState::Resolved);

        let served = Served {
            etag: format!("\"{}\"", descriptor.version),
            body: descriptor.table_of_contents(),
            media_type: TOC_MEDIA_TYPE.to_string(),
        };
        trace.advance(RequestState::Streamed);
        Ok(served)
    }

    pub async fn chapter(
        &self,
        user: &UserId,
        book: &BookId,
        chapter_id: &str,
    ) -> Result<Served<Vec<u8>>, ServeError> {
        let mut trace = RequestTrace::start("chapter", book);
        self.authorize(&mut trace, user, book).await?;
        let descriptor = self.descriptor(book).await.map_err(|e| trace.fail(e))?;
        let Some(entry) = descriptor.chapter(chapter_id) else {
            return Err(trace.fail(ServeError::NotFound(format!("chapter {chapter_id}"))));
        };
        trace.advance(RequestState::Resolved);

        let body = self
            .read(book, &descriptor.version, &entry.file)
            .await
            .map_err(|e| trace.fail(e))?;
        trace.advance(RequestState::Streamed);
        Ok(Served {
            body,
            media_type: CHAPTER_MEDIA_TYPE.to_string(),
            etag: format!("\"{}\"", entry.sha256),
        })
    }

    pub async fn resource(
        &self,
        user: &UserId,
        book: &BookId,
        path: &str,
    ) -> Result<Served<Vec<u8>>, ServeError> {
        let mut trace = RequestTrace::start("resource", book);
        self.authorize(&mut trace, user, book).await?;
        let descriptor = self.descriptor(book).await.map_err(|e| trace.fail(e))?;
        let Some(entry) = descriptor.resource(path) else {
            return Err(trace.fail(ServeError::NotFound(format!("resource {path}"))));
        };
        trace.advance(RequestState::Resolved);

        let body = self
            .read(book, &descriptor.version, &entry.file)
            .await
            .map_err(|e| trace.fail(e))?;
        trace.advance(RequestState::Streamed);
        Ok(Served {
            body,
            media_type: entry.media_type.clone(),
            etag: format!("\"{}\"", entry.sha256),
        })
    }

    /// Runs before any storage access. Errors and timeouts deny.
    async fn authorize(
        &self,
        trace: &mut RequestTrace<'_>,
        user: &UserId,
        book: &BookId,
    ) -> Result<(), ServeError> {
        let verdict = tokio::time::timeout(
            self.entitlement_timeout,
            self.entitlements.is_entitled(user, book),
        )
        .await;
        let allowed = match verdict {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(e)) => {
                tracing::debug!(user = %user, book = %book, error = %e, "entitlement check failed");
                false
            }
            Err(_) => {
                tracing::debug!(user = %user, book = %book, "entitlement check timed out");
                false
            }
        };
        if !allowed {
            return Err(trace.fail(ServeError::Forbidden {
                user: user.to_string(),
                book: book.to_string(),
            }));
        }
        trace.advance(RequestState::EntitlementChecked);
        Ok(())
    }

    async fn descriptor(&self, book: &BookId) -> Result<Arc<StructureDescriptor>, ServeError> {
        let pointer_path = self.store.pointer_path(book);
        let bytes = match tokio::fs::read(&pointer_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(ServeError::NotFound(format!("book {book}")));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: pointer_path.display().to_string(),
                    source,
                }
                .into())
            }
        };
        let pointer = CurrentPointer::from_json(&bytes).map_err(|source| StoreError::Descriptor {
            book_id: book.to_string(),
            source,
        })?;

        if let Some(descriptor) = self.cache.get(book, &pointer) {
            return Ok(descriptor);
        }

        let bytes = self.read(book, &pointer.version, DESCRIPTOR_FILE).await?;
        let descriptor = StructureDescriptor::from_json(&bytes).map_err(|source| {
            StoreError::Descriptor {
                book_id: book.to_string(),
                source,
            }
        })?;
        let descriptor = Arc::new(descriptor);
        self.cache.insert(Arc::clone(&descriptor));
        Ok(descriptor)
    }

    async fn read(&self, book: &BookId, version: &str, file: &str) -> Result<Vec<u8>, ServeError> {
        let path = self
            .store
            .version_dir(book, version)
            .and_then(|dir| safe_join(&dir, file))
            .ok_or_else(|| ServeError::NotFound(format!("book {book}")))?;
        tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == IoErrorKind::NotFound {
                ServeError::NotFound(format!("book {book}"))
            } else {
                StoreError::Io {
                    path: path.display().to_string(),
                    source,
                }
                .into()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::catalog::MemoryCatalog;
    use crate::entitlement::StaticEntitlements;
    use crate::error::{EntitlementError, ErrorKind};
    use crate::ingest::Ingestor;
    use crate::limits::IngestLimits;
    use crate::testkit::{EpubBuilder, TINY_PNG};
    use crate::upload::UploadedAsset;

    struct Fixture {
        _tmp: TempDir,
        store: BookStore,
        book: BookId,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = BookStore::new(tmp.path());
        let book = BookId::parse("moby").unwrap();
        let bytes = EpubBuilder::new("Moby")
            .chapter("c1", "c1.xhtml", "<h1>Call me</h1><img src=\"img/w.png\"/>")
            .chapter("c2", "c2.xhtml", "<p>Ishmael</p>")
            .resource("img/w.png", "image/png", TINY_PNG)
            .build();
        Ingestor::new(store.clone(), Arc::new(MemoryCatalog::new()), IngestLimits::default())
            .ingest(
                &book,
                UploadedAsset {
                    filename: "moby.epub".into(),
                    media_type: Some("application/epub+zip".into()),
                    bytes,
                },
                None,
            )
            .unwrap();
        Fixture {
            _tmp: tmp,
            store,
            book,
        }
    }

    fn server(store: BookStore, check: Arc<dyn EntitlementCheck>) -> ContentServer {
        ContentServer::new(
            store,
            check,
            Arc::new(DescriptorCache::new(8)),
            Duration::from_millis(200),
        )
    }

    fn user(name: &str) -> UserId {
        UserId::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_entitled_reads() {
        let fx = fixture();
        let srv = server(fx.store.clone(), Arc::new(StaticEntitlements::new([("alice", "moby")])));

        let toc = srv.table_of_contents(&user("alice"), &fx.book).await.unwrap();
        let ids: Vec<_> = toc.body.chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);

        let chapter = srv.chapter(&user("alice"), &fx.book, "c1").await.unwrap();
        let html = String::from_utf8(chapter.body).unwrap();
        assert!(html.contains("/api/books/moby/resources/OEBPS/img/w.png"), "{html}");
        assert_eq!(chapter.media_type, CHAPTER_MEDIA_TYPE);
        assert!(chapter.etag.starts_with('"') && chapter.etag.len() == 66);

        let image = srv
            .resource(&user("alice"), &fx.book, "OEBPS/img/w.png")
            .await
            .unwrap();
        assert_eq!(image.body, TINY_PNG);
        assert_eq!(image.media_type, "image/png");
    }

    #[tokio::test]
    async fn test_unentitled_is_forbidden_before_existence() {
        let fx = fixture();
        let srv = server(fx.store.clone(), Arc::new(StaticEntitlements::default()));
        let err = srv.chapter(&user("mallory"), &fx.book, "c1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let ghost = BookId::parse("ghost").unwrap();
        let err = srv.chapter(&user("mallory"), &ghost, "c1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_unknown_targets_are_not_found() {
        let fx = fixture();
        let srv = server(fx.store.clone(), Arc::new(StaticEntitlements::new([("*", "*")])));
        let alice = user("alice");
        for err in [
            srv.chapter(&alice, &fx.book, "C1").await.unwrap_err(),
            srv.resource(&alice, &fx.book, "OEBPS/img/../img/w.png").await.unwrap_err(),
            srv.resource(&alice, &fx.book, "OEBPS/content.opf").await.unwrap_err(),
            srv.table_of_contents(&alice, &BookId::parse("ghost").unwrap())
                .await
                .map(|_| ())
                .unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound, "{err}");
        }
    }

    struct SlowCheck;

    #[async_trait]
    impl EntitlementCheck for SlowCheck {
        async fn is_entitled(&self, _: &UserId, _: &BookId) -> Result<bool, EntitlementError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_entitlement_timeout_is_forbidden() {
        let fx = fixture();
        let srv = server(fx.store.clone(), Arc::new(SlowCheck));
        let err = srv.chapter(&user("alice"), &fx.book, "c1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    struct CountingCheck(AtomicUsize);

    #[async_trait]
    impl EntitlementCheck for CountingCheck {
        async fn is_entitled(&self, _: &UserId, _: &BookId) -> Result<bool, EntitlementError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_entitlement_checked_on_every_request() {
        let fx = fixture();
        let check = Arc::new(CountingCheck(AtomicUsize::new(0)));
        let srv = server(fx.store.clone(), check.clone());
        for _ in 0..3 {
            srv.chapter(&user("alice"), &fx.book, "c2").await.unwrap();
        }
        assert_eq!(check.0.load(Ordering::SeqCst), 3);
    }
}
