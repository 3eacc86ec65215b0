pub mod archive;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod descriptor;
pub mod entitlement;
pub mod error;
pub mod id;
pub mod ingest;
pub mod limits;
pub mod media;
pub mod paths;
pub mod persist;
pub mod progress;
pub mod sanitize;
pub mod serve;
pub mod stats;
pub mod structure;
pub mod upload;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub mod prelude {
    pub use crate::descriptor::{StructureDescriptor, TableOfContents};
    pub use crate::error::*;
    pub use crate::id::{BookId, UserId};
    pub use crate::ingest::{IngestReport, Ingestor};
    pub use crate::serve::ContentServer;
    pub use crate::upload::UploadedAsset;
}
