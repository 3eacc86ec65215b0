//! In-memory ZIP extraction with fail-closed path safety.
//!
//! Extraction runs in two passes. The first reads only the central directory
//! and rejects the whole archive on any unsafe name, symlink, duplicate, or
//! declared size over a limit. The second decompresses the surviving entries
//! through size-capped readers, since declared sizes are attacker-controlled.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::time::{Duration, Instant};

use serde::Serialize;
use zip::ZipArchive;

use crate::error::ExtractError;
use crate::limits::{
    check_compression_ratio, check_entry_size, check_file_count, check_total_size, IngestLimits,
};
use crate::media::{classify, image_matches_extension, EntryClass};
use crate::paths::normalize_entry_path;

/// One member of an extracted archive. `path` is always normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub data: Vec<u8>,
    pub is_dir: bool,
}

/// An entry skipped during extraction, kept for the ingestion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedEntry {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ExtractedArchive {
    pub entries: Vec<ArchiveEntry>,
    pub dropped: Vec<DroppedEntry>,
    index: HashMap<String, usize>,
}

impl ExtractedArchive {
    /// Look up a file entry by normalized path.
    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        self.index.get(path).map(|&i| &self.entries[i])
    }

    /// File entries in archive order.
    pub fn files(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.entries.iter().filter(|e| !e.is_dir)
    }

    pub fn was_dropped(&self, path: &str) -> bool {
        self.dropped.iter().any(|d| d.path == path)
    }

    fn push(&mut self, entry: ArchiveEntry) {
        if !entry.is_dir {
            self.index.insert(entry.path.clone(), self.entries.len());
        }
        self.entries.push(entry);
    }

    fn drop_entry(&mut self, path: String, reason: &str) {
        tracing::warn!(path = %path, reason, "dropping archive entry");
        self.dropped.push(DroppedEntry {
            path,
            reason: reason.to_string(),
        });
    }
}

enum Planned {
    Dir(String),
    File {
        index: usize,
        path: String,
        class: EntryClass,
        declared: u64,
    },
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Extract a ZIP-family archive held in memory.
pub fn extract_archive(
    bytes: &[u8],
    limits: &IngestLimits,
) -> Result<ExtractedArchive, ExtractError> {
    let started = Instant::now();
    let budget = Duration::from_secs(limits.max_extract_seconds);

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::NotAnArchive(e.to_string()))?;
    check_file_count(archive.len() as u64, limits)?;

    let mut result = ExtractedArchive::default();
    let plan = plan_entries(&mut archive, limits, &mut result)?;

    let mut total: u64 = 0;
    for planned in plan {
        if started.elapsed() > budget {
            return Err(ExtractError::Timeout {
                seconds: limits.max_extract_seconds,
            });
        }

        let (index, path, class, declared) = match planned {
            Planned::Dir(path) => {
                result.push(ArchiveEntry {
                    path,
                    data: Vec::new(),
                    is_dir: true,
                });
                continue;
            }
            Planned::File {
                index,
                path,
                class,
                declared,
            } => (index, path, class, declared),
        };

        let data = read_capped(&mut archive, index, &path, declared, limits)?;
        total += data.len() as u64;
        check_total_size(total, limits)?;

        if class == EntryClass::Image && !image_matches_extension(&path, &data) {
            result.drop_entry(path, "image content does not match its extension");
            continue;
        }

        result.push(ArchiveEntry {
            path,
            data,
            is_dir: false,
        });
    }

    tracing::debug!(
        entries = result.entries.len(),
        dropped = result.dropped.len(),
        bytes = total,
        "archive extracted"
    );
    Ok(result)
}

/// First pass: metadata only, no decompression.
fn plan_entries(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    limits: &IngestLimits,
    result: &mut ExtractedArchive,
) -> Result<Vec<Planned>, ExtractError> {
    let mut seen = HashSet::new();
    let mut plan = Vec::with_capacity(archive.len());
    let mut declared_total: u64 = 0;

    for index in 0..archive.len() {
        let file = archive.by_index_raw(index).map_err(|e| ExtractError::Corrupt {
            path: format!("#{index}"),
            detail: e.to_string(),
        })?;
        let raw_name = file.name().to_string();

        let path = normalize_entry_path(&raw_name).map_err(|reason| ExtractError::UnsafePath {
            path: raw_name.clone(),
            reason,
        })?;
        if file.unix_mode().is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
            return Err(ExtractError::Symlink { path: raw_name });
        }
        if !seen.insert(path.clone()) {
            return Err(ExtractError::DuplicatePath { path });
        }

        if file.is_dir() {
            plan.push(Planned::Dir(path));
            continue;
        }
        if file.encrypted() {
            return Err(ExtractError::Encrypted { path });
        }

        let declared = file.size();
        check_entry_size(&path, declared, limits)?;
        check_compression_ratio(&path, file.compressed_size(), declared, limits)?;
        declared_total = declared_total.saturating_add(declared);
        check_total_size(declared_total, limits)?;

        match classify(&path) {
            Some(class) => plan.push(Planned::File {
                index,
                path,
                class,
                declared,
            }),
            None => result.drop_entry(path, "extension not allowed"),
        }
    }

    Ok(plan)
}

/// Second pass: decompress one entry, never reading past the entry limit.
fn read_capped(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    index: usize,
    path: &str,
    declared: u64,
    limits: &IngestLimits,
) -> Result<Vec<u8>, ExtractError> {
    let corrupt = |detail: String| ExtractError::Corrupt {
        path: path.to_string(),
        detail,
    };

    let file = archive.by_index(index).map_err(|e| corrupt(e.to_string()))?;
    let mut data = Vec::with_capacity(declared.min(limits.max_entry_bytes) as usize);
    file.take(limits.max_entry_bytes + 1)
        .read_to_end(&mut data)
        .map_err(|e| corrupt(e.to_string()))?;

    check_entry_size(path, data.len() as u64, limits)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ZipBuilder;
    use crate::error::ErrorKind;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

    #[test]
    fn test_extracts_allowed_entries_and_drops_others() {
        let bytes = ZipBuilder::new()
            .dir("OEBPS/")
            .file("OEBPS/ch1.xhtml", b"<p>hi</p>")
            .file("OEBPS/img/a.png", PNG)
            .file("OEBPS/fonts/f.otf", b"font")
            .file("OEBPS/app.js", b"alert(1)")
            .finish();

        let out = extract_archive(&bytes, &IngestLimits::default()).unwrap();
        assert_eq!(out.get("OEBPS/ch1.xhtml").unwrap().data, b"<p>hi</p>");
        assert!(out.get("OEBPS/img/a.png").is_some());
        assert!(out.entries.iter().any(|e| e.is_dir && e.path == "OEBPS"));
        assert!(out.was_dropped("OEBPS/fonts/f.otf"));
        assert!(out.was_dropped("OEBPS/app.js"));
        assert_eq!(out.files().count(), 2);
    }

    #[test]
    fn test_traversal_rejects_whole_archive() {
        for evil in ["../../etc/passwd", "/etc/passwd", "a\\..\\..\\b.txt", "C:/x.txt"] {
            let bytes = ZipBuilder::new()
                .file("ok.xhtml", b"<p>fine</p>")
                .file(evil, b"root:x:0:0")
                .finish();
            let err = extract_archive(&bytes, &IngestLimits::default()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnsafeArchive, "{evil}");
        }
    }

    #[test]
    fn test_duplicate_normalized_paths_rejected() {
        let bytes = ZipBuilder::new()
            .file("a/b.xhtml", b"1")
            .file("a//b.xhtml", b"2")
            .finish();
        let err = extract_archive(&bytes, &IngestLimits::default()).unwrap_err();
        assert!(matches!(err, ExtractError::DuplicatePath { .. }));
    }

    #[test]
    fn test_symlink_rejected() {
        let bytes = ZipBuilder::new()
            .symlink("link.xhtml", "/etc/passwd")
            .finish();
        let err = extract_archive(&bytes, &IngestLimits::default()).unwrap_err();
        assert!(matches!(err, ExtractError::Symlink { .. }));
    }

    #[test]
    fn test_entry_size_limit() {
        let limits = IngestLimits {
            max_entry_bytes: 16,
            ..IngestLimits::default()
        };
        let bytes = ZipBuilder::new()
            .file("big.xhtml", &[b'a'; 64])
            .finish();
        let err = extract_archive(&bytes, &limits).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EntryTooLarge);
    }

    #[test]
    fn test_total_size_limit() {
        let limits = IngestLimits {
            max_total_bytes: 100,
            ..IngestLimits::default()
        };
        let bytes = ZipBuilder::new()
            .file("a.xhtml", &[b'a'; 60])
            .file("b.xhtml", &[b'b'; 60])
            .finish();
        let err = extract_archive(&bytes, &limits).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
    }

    #[test]
    fn test_file_count_limit() {
        let limits = IngestLimits {
            max_file_count: 2,
            ..IngestLimits::default()
        };
        let bytes = ZipBuilder::new()
            .file("a.xhtml", b"a")
            .file("b.xhtml", b"b")
            .file("c.xhtml", b"c")
            .finish();
        assert!(matches!(
            extract_archive(&bytes, &limits),
            Err(ExtractError::TooManyFiles { count: 3, limit: 2 })
        ));
    }

    #[test]
    fn test_mislabelled_image_dropped() {
        let bytes = ZipBuilder::new()
            .file("img/a.png", b"<script>alert(1)</script>")
            .finish();
        let out = extract_archive(&bytes, &IngestLimits::default()).unwrap();
        assert!(out.get("img/a.png").is_none());
        assert!(out.was_dropped("img/a.png"));
    }

    #[test]
    fn test_not_a_zip() {
        let err = extract_archive(b"definitely not a zip", &IngestLimits::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    }
}
