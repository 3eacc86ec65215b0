use serde::{Deserialize, Serialize};

/// Failure classes surfaced to callers of the pipeline and the read API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PayloadTooLarge,
    UnsupportedFormat,
    UnsafeArchive,
    EntryTooLarge,
    MalformedPackage,
    SanitizationLimitExceeded,
    PersistenceFailure,
    Forbidden,
    NotFound,
    ExtractionTimeout,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PayloadTooLarge => "PayloadTooLarge",
            ErrorKind::UnsupportedFormat => "UnsupportedFormat",
            ErrorKind::UnsafeArchive => "UnsafeArchive",
            ErrorKind::EntryTooLarge => "EntryTooLarge",
            ErrorKind::MalformedPackage => "MalformedPackage",
            ErrorKind::SanitizationLimitExceeded => "SanitizationLimitExceeded",
            ErrorKind::PersistenceFailure => "PersistenceFailure",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ExtractionTimeout => "ExtractionTimeout",
            ErrorKind::InvalidRequest => "InvalidRequest",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level ingestion error. Every stage error converts into this.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Upload rejected: {0}")]
    Validate(#[from] ValidateError),

    #[error("Archive rejected: {0}")]
    Extract(#[from] ExtractError),

    #[error("Structure error: {0}")]
    Structure(#[from] StructureError),

    #[error("Sanitization error: {0}")]
    Sanitize(#[from] SanitizeError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Validate(e) => e.kind(),
            IngestError::Extract(e) => e.kind(),
            IngestError::Structure(e) => e.kind(),
            IngestError::Sanitize(e) => e.kind(),
            IngestError::Persist(_) | IngestError::Catalog(_) => ErrorKind::PersistenceFailure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("Upload is {size} bytes, exceeding limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Upload is empty")]
    Empty,

    #[error("Unsupported file extension: {0}")]
    UnsupportedExtension(String),

    #[error("Declared media type {media_type} does not match .{extension}")]
    MediaTypeMismatch {
        media_type: String,
        extension: String,
    },

    #[error("Content does not look like {expected}")]
    BadSignature { expected: &'static str },

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

impl ValidateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidateError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            ValidateError::InvalidId(_) => ErrorKind::InvalidRequest,
            _ => ErrorKind::UnsupportedFormat,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Not a readable ZIP archive: {0}")]
    NotAnArchive(String),

    #[error("Unsafe archive entry path {path:?}: {reason}")]
    UnsafePath { path: String, reason: &'static str },

    #[error("Duplicate archive entry after normalization: {path}")]
    DuplicatePath { path: String },

    #[error("Archive entry {path} is a symbolic link")]
    Symlink { path: String },

    #[error("Archive entry {path} is encrypted")]
    Encrypted { path: String },

    #[error("Archive contains {count} entries, exceeding limit of {limit}")]
    TooManyFiles { count: u64, limit: u64 },

    #[error("Entry {path} is {size} bytes, exceeding limit of {limit} bytes")]
    EntryTooLarge { path: String, size: u64, limit: u64 },

    #[error("Entry {path} decompression ratio {ratio}:1 exceeds limit {limit}:1")]
    CompressionRatio { path: String, ratio: u64, limit: u64 },

    #[error("Archive expands to {total} bytes, exceeding limit of {limit} bytes")]
    TotalTooLarge { total: u64, limit: u64 },

    #[error("Extraction exceeded {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Corrupt archive entry {path}: {detail}")]
    Corrupt { path: String, detail: String },
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::NotAnArchive(_) | ExtractError::Encrypted { .. } => {
                ErrorKind::UnsupportedFormat
            }
            ExtractError::UnsafePath { .. }
            | ExtractError::DuplicatePath { .. }
            | ExtractError::Symlink { .. } => ErrorKind::UnsafeArchive,
            ExtractError::EntryTooLarge { .. } | ExtractError::CompressionRatio { .. } => {
                ErrorKind::EntryTooLarge
            }
            ExtractError::TooManyFiles { .. } | ExtractError::TotalTooLarge { .. } => {
                ErrorKind::PayloadTooLarge
            }
            ExtractError::Timeout { .. } => ErrorKind::ExtractionTimeout,
            ExtractError::Corrupt { .. } => ErrorKind::MalformedPackage,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StructureError {
    #[error("Malformed package: {0}")]
    Malformed(String),

    #[error("DRM protected book ({0})")]
    DrmProtected(String),

    #[error("No readable document in upload")]
    NoDocument,
}

impl StructureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StructureError::DrmProtected(_) => ErrorKind::UnsupportedFormat,
            _ => ErrorKind::MalformedPackage,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SanitizeError {
    #[error("Markup is {size} bytes, exceeding limit of {limit} bytes")]
    InputTooLarge { size: u64, limit: u64 },

    #[error("Markup nesting depth {depth} exceeds limit of {limit}")]
    ExcessiveNesting { depth: u32, limit: u32 },
}

impl SanitizeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SanitizationLimitExceeded
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Write to {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to write outside the book layout: {0}")]
    UnsafePath(String),

    #[error("Descriptor serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog is unreadable: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Catalog lock poisoned")]
    Poisoned,
}

/// Errors from reading a persisted layout.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No completed layout for book {0}")]
    Missing(String),

    #[error("Read of {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Descriptor for book {book_id} is unreadable: {source}")]
    Descriptor {
        book_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("Entitlement service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Entitlement service returned status {0}")]
    Status(u16),
}

/// Per-request read failures.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("User {user} is not entitled to book {book}")]
    Forbidden { user: String, book: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(StoreError),
}

impl ServeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServeError::Forbidden { .. } => ErrorKind::Forbidden,
            ServeError::NotFound(_) => ErrorKind::NotFound,
            ServeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ServeError::Store(_) => ErrorKind::PersistenceFailure,
        }
    }
}

impl From<StoreError> for ServeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Missing(book) => ServeError::NotFound(format!("book {book}")),
            other => ServeError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_error_kinds() {
        let err: IngestError = ExtractError::UnsafePath {
            path: "../x".into(),
            reason: "parent directory segment",
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::UnsafeArchive);

        let err: IngestError = ValidateError::PayloadTooLarge { size: 2, limit: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);

        let err: IngestError = StructureError::DrmProtected("Adobe DRM".into()).into();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);

        let err: IngestError = PersistError::UnsafePath("x".into()).into();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
    }

    #[test]
    fn test_missing_layout_is_not_found() {
        let err: ServeError = StoreError::Missing("b1".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_kind_serializes_as_name() {
        let json = serde_json::to_string(&ErrorKind::EntryTooLarge).unwrap();
        assert_eq!(json, "\"EntryTooLarge\"");
    }
}
