//! Upload gate: size, extension, and declared media type checks that run
//! before a single byte of the upload is parsed.

use serde::{Deserialize, Serialize};

use crate::error::ValidateError;
use crate::limits::IngestLimits;
use crate::media::decode_text;
use crate::paths::extension_of;

/// What the uploader told us about a file.
#[derive(Debug, Clone)]
pub struct UploadDeclaration<'a> {
    pub filename: &'a str,
    pub media_type: Option<&'a str>,
    pub size: u64,
}

/// The raw upload handed from the validator to the extractor.
#[derive(Debug, Clone)]
pub struct UploadedAsset {
    pub filename: String,
    pub media_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedAsset {
    pub fn declaration(&self) -> UploadDeclaration<'_> {
        UploadDeclaration {
            filename: &self.filename,
            media_type: self.media_type.as_deref(),
            size: self.bytes.len() as u64,
        }
    }
}

/// Upload shape, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    /// A packaged book archive (`.epub`).
    Packaged,
    /// A zipped bundle of HTML pages with their images and styles.
    HtmlBundle,
    /// A single HTML document.
    Html,
    /// A plain-text document.
    PlainText,
}

impl UploadKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "epub" => Some(UploadKind::Packaged),
            "zip" => Some(UploadKind::HtmlBundle),
            "html" | "htm" | "xhtml" => Some(UploadKind::Html),
            "txt" => Some(UploadKind::PlainText),
            _ => None,
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, UploadKind::Packaged | UploadKind::HtmlBundle)
    }

    /// Media types an uploader may declare for this kind.
    fn accepts_media_type(&self, media_type: &str) -> bool {
        match self {
            UploadKind::Packaged => matches!(media_type, "application/epub+zip" | "application/zip"),
            UploadKind::HtmlBundle => matches!(
                media_type,
                "application/zip" | "application/x-zip-compressed" | "application/x-zip"
            ),
            UploadKind::Html => matches!(media_type, "text/html" | "application/xhtml+xml"),
            UploadKind::PlainText => media_type == "text/plain",
        }
    }
}

/// Accept or reject an upload from its declaration alone.
pub fn validate_upload(
    declaration: &UploadDeclaration<'_>,
    limits: &IngestLimits,
) -> Result<UploadKind, ValidateError> {
    if declaration.size > limits.max_upload_bytes {
        return Err(ValidateError::PayloadTooLarge {
            size: declaration.size,
            limit: limits.max_upload_bytes,
        });
    }
    if declaration.size == 0 {
        return Err(ValidateError::Empty);
    }

    let extension = extension_of(declaration.filename)
        .ok_or_else(|| ValidateError::UnsupportedExtension(declaration.filename.to_string()))?;
    let kind = UploadKind::from_extension(&extension)
        .ok_or_else(|| ValidateError::UnsupportedExtension(extension.clone()))?;

    if let Some(declared) = declaration.media_type {
        let essence = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let generic = essence.is_empty() || essence == "application/octet-stream";
        if !generic && !kind.accepts_media_type(&essence) {
            return Err(ValidateError::MediaTypeMismatch {
                media_type: essence,
                extension,
            });
        }
    }

    Ok(kind)
}

/// Cheap content sniff run before extraction: archives must carry a local file
/// header, text uploads must be UTF-8.
pub fn check_signature(kind: UploadKind, bytes: &[u8]) -> Result<(), ValidateError> {
    if kind.is_archive() {
        if !bytes.starts_with(b"PK\x03\x04") {
            return Err(ValidateError::BadSignature {
                expected: "a ZIP archive",
            });
        }
        return Ok(());
    }

    match decode_text(bytes) {
        Some(text) if !looks_binary(text) => Ok(()),
        _ => Err(ValidateError::BadSignature {
            expected: "UTF-8 text",
        }),
    }
}

/// More than 0.1% control characters other than whitespace.
fn looks_binary(text: &str) -> bool {
    let binary = text
        .bytes()
        .filter(|&b| b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
        .count();
    binary * 1000 >= text.len().max(1) && binary > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl<'a>(filename: &'a str, media_type: Option<&'a str>, size: u64) -> UploadDeclaration<'a> {
        UploadDeclaration {
            filename,
            media_type,
            size,
        }
    }

    #[test]
    fn test_accepts_known_kinds() {
        let limits = IngestLimits::default();
        let cases = [
            ("book.epub", Some("application/epub+zip"), UploadKind::Packaged),
            ("site.zip", Some("application/zip"), UploadKind::HtmlBundle),
            ("page.HTML", Some("text/html; charset=utf-8"), UploadKind::Html),
            ("notes.txt", None, UploadKind::PlainText),
            ("book.epub", Some("application/octet-stream"), UploadKind::Packaged),
        ];
        for (name, media, expected) in cases {
            assert_eq!(validate_upload(&decl(name, media, 10), &limits).unwrap(), expected);
        }
    }

    #[test]
    fn test_rejects_oversize_before_anything_else() {
        let limits = IngestLimits::default();
        let err = validate_upload(&decl("x.exe", None, limits.max_upload_bytes + 1), &limits)
            .unwrap_err();
        assert!(matches!(err, ValidateError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_rejects_unknown_extension() {
        let limits = IngestLimits::default();
        for name in ["run.exe", "book.pdf", "noext", "archive.tar.gz"] {
            let err = validate_upload(&decl(name, None, 10), &limits).unwrap_err();
            assert!(matches!(err, ValidateError::UnsupportedExtension(_)), "{name}");
        }
    }

    #[test]
    fn test_rejects_media_type_mismatch() {
        let limits = IngestLimits::default();
        let err = validate_upload(&decl("book.epub", Some("text/html"), 10), &limits).unwrap_err();
        assert!(matches!(err, ValidateError::MediaTypeMismatch { .. }));
    }

    #[test]
    fn test_rejects_empty() {
        let limits = IngestLimits::default();
        assert!(matches!(
            validate_upload(&decl("a.txt", None, 0), &limits),
            Err(ValidateError::Empty)
        ));
    }

    #[test]
    fn test_signature() {
        assert!(check_signature(UploadKind::Packaged, b"PK\x03\x04rest").is_ok());
        assert!(check_signature(UploadKind::Packaged, b"%PDF-1.7").is_err());
        assert!(check_signature(UploadKind::Html, b"\xEF\xBB\xBF<p>hi</p>").is_ok());
        assert!(check_signature(UploadKind::PlainText, &[0xC3, 0x28]).is_err());
        assert!(check_signature(UploadKind::PlainText, b"\x00\x01\x02\x03").is_err());
    }
}
