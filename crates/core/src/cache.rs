//! Service-scoped, bounded cache of parsed descriptors.

use std::sync::Arc;

use moka::sync::Cache;

use crate::descriptor::StructureDescriptor;
use crate::id::BookId;
use crate::persist::CurrentPointer;

type Key = (BookId, String);

/// Descriptors keyed by (book id, content hash). A hit also has to match the
/// pointer's version, since identical content can be re-ingested.
#[derive(Clone)]
pub struct DescriptorCache {
    cache: Cache<Key, Arc<StructureDescriptor>>,
}

impl std::fmt::Debug for DescriptorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl DescriptorCache {
    pub fn new(capacity: usize) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity.max(1) as u64)
            .build();
        Self { cache }
    }

    pub fn get(&self, book_id: &BookId, pointer: &CurrentPointer) -> Option<Arc<StructureDescriptor>> {
        self.cache
            .get(&(book_id.clone(), pointer.content_hash.clone()))
            .filter(|d| d.version == pointer.version)
    }

    pub fn insert(&self, descriptor: Arc<StructureDescriptor>) {
        let key = (descriptor.book_id.clone(), descriptor.content_hash.clone());
        self.cache.insert(key, descriptor);
    }

    /// Drop every cached version of a book.
    pub fn invalidate(&self, book_id: &BookId) {
        let stale: Vec<Arc<Key>> = self
            .cache
            .iter()
            .filter(|(key, _)| &key.0 == book_id)
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            self.cache.invalidate(key.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        usize::try_from(self.cache.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DescriptorCache {
    fn default() -> Self {
        Self::new(256)
    }
}
