//! HTTP surface for the book pipeline.
//!
//! Uploads go through `PUT /api/books/:book_id` and run the full ingestion
//! pipeline on a blocking worker. Reads (table of contents, chapters and
//! resources) are served from the published layout and gated by an
//! entitlement check on every request.

pub mod api;
pub mod config;

use std::sync::Arc;

use axum::Router;

use book_pipeline_core::cache::DescriptorCache;
use book_pipeline_core::catalog::{BookCatalog, JsonCatalog};
use book_pipeline_core::config::entitlement_from_config;
use book_pipeline_core::entitlement::EntitlementCheck;
use book_pipeline_core::error::EntitlementError;
use book_pipeline_core::ingest::Ingestor;
use book_pipeline_core::persist::BookStore;
use book_pipeline_core::serve::ContentServer;

use crate::config::ServerConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub content: Arc<ContentServer>,
    pub catalog: Arc<dyn BookCatalog>,
    pub config: ServerConfig,
}

impl AppState {
    /// State with the entitlement check described by `config`.
    pub fn new(config: ServerConfig) -> Result<Self, EntitlementError> {
        let check = entitlement_from_config(&config.entitlement)?;
        Ok(Self::with_entitlements(config, check))
    }

    pub fn with_entitlements(config: ServerConfig, check: Arc<dyn EntitlementCheck>) -> Self {
        if let Err(e) = std::fs::create_dir_all(&config.root) {
            tracing::warn!(root = %config.root.display(), error = %e, "cannot create storage root");
        }
        let store = BookStore::new(config.root.clone());
        let catalog: Arc<dyn BookCatalog> = Arc::new(JsonCatalog::in_root(&config.root));
        let cache = Arc::new(DescriptorCache::new(config.descriptor_cache_size));

        let ingestor = Ingestor::new(store.clone(), catalog.clone(), config.limits.clone())
            .with_cache(cache.clone())
            .with_resource_url_prefix(config.resource_url_prefix.clone());
        let content = ContentServer::new(store, check, cache, config.entitlement.timeout());

        Self {
            ingestor: Arc::new(ingestor),
            content: Arc::new(content),
            catalog,
            config,
        }
    }
}

/// Build API routes (under /api) with state.
pub fn api_routes(state: AppState) -> Router {
    api::routes(state)
}
