//! Extension allowlist for archive entries and media type inference.
//!
//! Media types are always derived from the stored path, never from anything
//! the uploader declared.

use image::ImageFormat;

use crate::paths::extension_of;

/// Broad class of an allowed archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    /// Markup, package metadata, or plain text.
    Text,
    Stylesheet,
    Image,
}

/// Classify an entry path against the allowlist. `None` means the entry is dropped.
pub fn classify(path: &str) -> Option<EntryClass> {
    if path == "mimetype" {
        return Some(EntryClass::Text);
    }
    match extension_of(path)?.as_str() {
        "xhtml" | "html" | "htm" | "xml" | "opf" | "ncx" | "txt" => Some(EntryClass::Text),
        "css" => Some(EntryClass::Stylesheet),
        // SVG can carry script and is not on the list.
        "jpg" | "jpeg" | "png" | "gif" | "webp" => Some(EntryClass::Image),
        _ => None,
    }
}

/// Media type for a stored path, inferred from its extension.
pub fn media_type_for(path: &str) -> &'static str {
    match extension_of(path).as_deref() {
        Some("xhtml") => "application/xhtml+xml",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") | Some("opf") | Some("ncx") => "application/xml",
        _ => "application/octet-stream",
    }
}

/// True for manifest media types that can be read as a chapter.
pub fn is_textual_media_type(media_type: &str) -> bool {
    matches!(
        media_type.trim().to_ascii_lowercase().as_str(),
        "application/xhtml+xml" | "text/html" | "application/x-dtbook+xml"
    )
}

/// Verify that a raster image's bytes match its extension.
pub fn image_matches_extension(path: &str, data: &[u8]) -> bool {
    let expected = match extension_of(path).as_deref() {
        Some("jpg") | Some("jpeg") => ImageFormat::Jpeg,
        Some("png") => ImageFormat::Png,
        Some("gif") => ImageFormat::Gif,
        Some("webp") => ImageFormat::WebP,
        _ => return false,
    };
    matches!(image::guess_format(data), Ok(found) if found == expected)
}

/// Decode a text entry as UTF-8, skipping a byte order mark.
pub fn decode_text(bytes: &[u8]) -> Option<&str> {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    std::str::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_allowlist() {
        assert_eq!(classify("OEBPS/ch1.xhtml"), Some(EntryClass::Text));
        assert_eq!(classify("mimetype"), Some(EntryClass::Text));
        assert_eq!(classify("OEBPS/style.CSS"), Some(EntryClass::Stylesheet));
        assert_eq!(classify("img/a.jpeg"), Some(EntryClass::Image));
        assert_eq!(classify("fonts/a.otf"), None);
        assert_eq!(classify("scripts/app.js"), None);
        assert_eq!(classify("img/logo.svg"), None);
        assert_eq!(classify("README"), None);
    }

    #[test]
    fn test_media_type_for() {
        assert_eq!(media_type_for("a/b.PNG"), "image/png");
        assert_eq!(media_type_for("s.css"), "text/css; charset=utf-8");
        assert_eq!(media_type_for("x.bin"), "application/octet-stream");
    }

    #[test]
    fn test_image_magic() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert!(image_matches_extension("a.png", &png));
        assert!(!image_matches_extension("a.jpg", &png));
        assert!(!image_matches_extension("a.png", b"<html>"));
        assert!(!image_matches_extension("a.svg", b"<svg/>"));
    }

    #[test]
    fn test_decode_text_skips_bom() {
        assert_eq!(decode_text(&[0xEF, 0xBB, 0xBF, b'H', b'i']), Some("Hi"));
        assert_eq!(decode_text(&[0xFF, 0xFE]), None);
    }
}
