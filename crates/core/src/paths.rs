//! Path normalization shared by extraction, reference resolution, and storage.
//!
//! Archive entry names and in-book references are untrusted. Everything that
//! turns one of them into a storage path goes through [`normalize_entry_path`]
//! or [`safe_join`].

use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};

/// Normalize an archive entry name into a relative `/`-separated path.
///
/// Empty and `.` segments are collapsed. Backslashes, NUL bytes, absolute
/// roots, drive prefixes, and `..` segments are rejected with a reason.
pub fn normalize_entry_path(raw: &str) -> Result<String, &'static str> {
    if raw.contains('\0') {
        return Err("NUL byte in path");
    }
    if raw.contains('\\') {
        return Err("backslash in path");
    }
    if raw.starts_with('/') {
        return Err("absolute path");
    }
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err("drive prefix");
    }

    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err("parent directory segment"),
            s if s.chars().any(|c| c.is_control()) => return Err("control character in path"),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err("empty path");
    }
    Ok(segments.join("/"))
}

/// A reference found in book content, resolved against the containing document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    /// Normalized book-relative path of the target.
    pub path: String,
    pub fragment: Option<String>,
}

/// Resolve a relative `href`/`src` against the path of the document holding it.
///
/// Returns `None` for anything that leaves the book: absolute paths, URLs with
/// a scheme, or `..` segments that climb above the archive root.
pub fn resolve_reference(base_path: &str, reference: &str) -> Option<ResolvedRef> {
    let reference = reference.trim();
    if reference.is_empty() || has_scheme(reference) || reference.starts_with('/') {
        return None;
    }

    let (without_fragment, fragment) = match reference.split_once('#') {
        Some((p, f)) => (p, Some(f.to_string()).filter(|f| !f.is_empty())),
        None => (reference, None),
    };
    let raw_path = without_fragment
        .split_once('?')
        .map_or(without_fragment, |(p, _)| p);

    if raw_path.is_empty() {
        return Some(ResolvedRef {
            path: base_path.to_string(),
            fragment,
        });
    }

    let decoded = percent_decode_str(raw_path).decode_utf8().ok()?;
    if decoded.contains('\\') || decoded.contains('\0') {
        return None;
    }

    let mut segments: Vec<&str> = match base_path.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').filter(|s| !s.is_empty()).collect(),
        None => Vec::new(),
    };
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return None;
    }

    Some(ResolvedRef {
        path: segments.join("/"),
        fragment,
    })
}

/// True when the reference starts with a URI scheme such as `http:` or `data:`.
pub fn has_scheme(reference: &str) -> bool {
    match reference.find(':') {
        Some(idx) => {
            let scheme = &reference[..idx];
            !scheme.is_empty()
                && scheme
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Join a book-relative path under `root`, refusing anything that would escape it.
pub fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let normalized = normalize_entry_path(relative).ok()?;
    let mut joined = root.to_path_buf();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            _ => return None,
        }
    }
    joined.starts_with(root).then_some(joined)
}

/// Reduce an uploaded filename to a storage-safe name, keeping its extension.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let (stem, ext) = match base.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (base, None),
    };

    let mut clean: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(50)
        .collect();
    if clean.is_empty() {
        clean.push_str("upload");
    }

    match ext {
        Some(e) if !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!("{clean}.{}", e.to_ascii_lowercase())
        }
        _ => clean,
    }
}

/// Lowercased extension of a path, if any.
pub fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.')
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_safe_paths() {
        assert_eq!(
            normalize_entry_path("OEBPS/text/ch1.xhtml").unwrap(),
            "OEBPS/text/ch1.xhtml"
        );
        assert_eq!(normalize_entry_path("./a//b/./c.css").unwrap(), "a/b/c.css");
        assert_eq!(normalize_entry_path("images/").unwrap(), "images");
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        assert!(normalize_entry_path("../../etc/passwd").is_err());
        assert!(normalize_entry_path("content/../../etc/shadow").is_err());
        assert!(normalize_entry_path("a/b/..").is_err());
        assert!(normalize_entry_path("/etc/passwd").is_err());
        assert!(normalize_entry_path("..\\..\\evil").is_err());
        assert!(normalize_entry_path("C:/Windows/System32").is_err());
        assert!(normalize_entry_path("a\0b").is_err());
        assert!(normalize_entry_path("./").is_err());
    }

    #[test]
    fn test_resolve_relative_reference() {
        let r = resolve_reference("OEBPS/text/ch1.xhtml", "../images/fig%201.png").unwrap();
        assert_eq!(r.path, "OEBPS/images/fig 1.png");
        assert_eq!(r.fragment, None);

        let r = resolve_reference("OEBPS/text/ch1.xhtml", "ch2.xhtml#sec").unwrap();
        assert_eq!(r.path, "OEBPS/text/ch2.xhtml");
        assert_eq!(r.fragment.as_deref(), Some("sec"));

        let r = resolve_reference("OEBPS/text/ch1.xhtml", "#note-3").unwrap();
        assert_eq!(r.path, "OEBPS/text/ch1.xhtml");
        assert_eq!(r.fragment.as_deref(), Some("note-3"));
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        assert!(resolve_reference("ch1.xhtml", "../outside.png").is_none());
        assert!(resolve_reference("a/ch1.xhtml", "/etc/passwd").is_none());
        assert!(resolve_reference("a/ch1.xhtml", "http://example.com/x.png").is_none());
        assert!(resolve_reference("a/ch1.xhtml", "data:image/png;base64,AAAA").is_none());
        assert!(resolve_reference("a/ch1.xhtml", "..%5C..%5Cx").is_none());
    }

    #[test]
    fn test_has_scheme() {
        assert!(has_scheme("javascript:alert(1)"));
        assert!(has_scheme("mailto:a@b.c"));
        assert!(!has_scheme("images/a:b.png"));
        assert!(!has_scheme("1http:x"));
        assert!(!has_scheme("chapter.xhtml"));
    }

    #[test]
    fn test_safe_join_stays_inside_root() {
        let root = Path::new("/srv/books/b1");
        assert_eq!(
            safe_join(root, "resources/img/a.png").unwrap(),
            PathBuf::from("/srv/books/b1/resources/img/a.png")
        );
        assert!(safe_join(root, "../b2/structure.json").is_none());
        assert!(safe_join(root, "/etc/passwd").is_none());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Book (2nd ed).EPUB"), "My_Book__2nd_ed_.epub");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(".hidden"), "_hidden");
        let long = format!("{}.txt", "a".repeat(80));
        assert_eq!(sanitize_filename(&long).len(), 54);
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("OEBPS/Text/CH1.XHTML").as_deref(), Some("xhtml"));
        assert_eq!(extension_of("mimetype"), None);
        assert_eq!(extension_of("dir.d/file"), None);
    }
}
