//! Resource ceilings for ingestion: upload size, archive bomb protection,
//! markup limits, and DRM detection.

use serde::{Deserialize, Serialize};

use crate::error::{ExtractError, StructureError};

/// Entries smaller than this are never flagged for their compression ratio.
/// Short runs of whitespace compress extremely well without being a bomb.
const RATIO_CHECK_FLOOR: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestLimits {
    /// Maximum size of one upload in bytes.
    pub max_upload_bytes: u64,
    /// Maximum number of entries in an archive.
    pub max_file_count: u64,
    /// Maximum decompressed size of a single archive entry.
    pub max_entry_bytes: u64,
    /// Maximum total decompressed size of an archive.
    pub max_total_bytes: u64,
    /// Maximum decompression ratio before flagging as ZIP bomb.
    pub max_compression_ratio: u64,
    /// Wall-clock budget for extracting one archive.
    pub max_extract_seconds: u64,
    /// Maximum markup nesting depth accepted by the sanitizer.
    pub max_nesting_depth: u32,
    /// Largest textual unit the sanitizer will parse.
    pub max_input_bytes: u64,
    /// Output cap for one sanitized chapter.
    pub max_unit_bytes: u64,
    /// Output cap for the aggregate book document.
    pub max_document_bytes: u64,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 50 * 1024 * 1024,   // 50 MB
            max_file_count: 10_000,
            max_entry_bytes: 32 * 1024 * 1024,    // 32 MB
            max_total_bytes: 256 * 1024 * 1024,   // 256 MB
            max_compression_ratio: 100,
            max_extract_seconds: 30,
            max_nesting_depth: 200,
            max_input_bytes: 8 * 1024 * 1024,     // 8 MB
            max_unit_bytes: 2 * 1024 * 1024,      // 2 MB
            max_document_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Check the number of entries in an archive.
pub fn check_file_count(count: u64, limits: &IngestLimits) -> Result<(), ExtractError> {
    if count > limits.max_file_count {
        return Err(ExtractError::TooManyFiles {
            count,
            limit: limits.max_file_count,
        });
    }
    Ok(())
}

/// Check a single entry's declared or observed decompressed size.
pub fn check_entry_size(path: &str, size: u64, limits: &IngestLimits) -> Result<(), ExtractError> {
    if size > limits.max_entry_bytes {
        return Err(ExtractError::EntryTooLarge {
            path: path.to_string(),
            size,
            limit: limits.max_entry_bytes,
        });
    }
    Ok(())
}

/// Check an entry's decompression ratio (ZIP bomb detection).
pub fn check_compression_ratio(
    path: &str,
    compressed: u64,
    uncompressed: u64,
    limits: &IngestLimits,
) -> Result<(), ExtractError> {
    if uncompressed <= RATIO_CHECK_FLOOR {
        return Ok(());
    }
    let ratio = if compressed == 0 {
        u64::MAX
    } else {
        uncompressed / compressed
    };
    if ratio > limits.max_compression_ratio {
        return Err(ExtractError::CompressionRatio {
            path: path.to_string(),
            ratio,
            limit: limits.max_compression_ratio,
        });
    }
    Ok(())
}

/// Check the running decompressed total of an archive.
pub fn check_total_size(total: u64, limits: &IngestLimits) -> Result<(), ExtractError> {
    if total > limits.max_total_bytes {
        return Err(ExtractError::TotalTooLarge {
            total,
            limit: limits.max_total_bytes,
        });
    }
    Ok(())
}

/// Inspect a package's `META-INF/encryption.xml` for DRM.
///
/// Font obfuscation is not DRM and passes.
pub fn check_drm(encryption_xml: &str) -> Result<(), StructureError> {
    if encryption_xml.contains("http://ns.adobe.com/adept")
        || encryption_xml.contains("http://ns.adobe.com/digitaleditions")
    {
        return Err(StructureError::DrmProtected("Adobe DRM".to_string()));
    }

    if encryption_xml.contains("http://www.apple.com/ibooks") || encryption_xml.contains("sinf") {
        return Err(StructureError::DrmProtected("Apple FairPlay".to_string()));
    }

    if encryption_xml.contains("http://urms.org") {
        return Err(StructureError::DrmProtected("Sony URMS".to_string()));
    }

    if encryption_xml.contains("EncryptedData") {
        let is_font_obfuscation = encryption_xml.contains("http://www.idpf.org/2008/embedding")
            || encryption_xml.contains("http://ns.adobe.com/pdf/enc#RC");
        if !is_font_obfuscation {
            return Err(StructureError::DrmProtected("Unknown DRM".to_string()));
        }
    }

    Ok(())
}
