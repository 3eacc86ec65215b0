//! The per-version structure descriptor (`structure.json`) and the table of
//! contents derived from it.

use serde::{Deserialize, Serialize};

use crate::id::BookId;
use crate::structure::{BookMetadata, BrokenReference, NavNode, SourceFormat};

pub const SCHEMA_VERSION: u32 = 1;
pub const DESCRIPTOR_FILE: &str = "structure.json";
pub const BOOK_FILE: &str = "book.html";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterEntry {
    pub id: String,
    pub index: usize,
    pub title: String,
    pub anchor: String,
    /// Version-relative path of the stored fragment.
    pub file: String,
    #[serde(default)]
    pub stylesheets: Vec<String>,
    pub word_count: u64,
    pub size: u64,
    pub sha256: String,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Book-relative path, as referenced from chapters.
    pub path: String,
    pub file: String,
    pub media_type: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalUpload {
    pub filename: String,
    pub file: String,
    pub media_type: Option<String>,
    pub size: u64,
    pub sha256: String,
}

/// Everything a reader needs to navigate one stored version of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureDescriptor {
    pub schema_version: u32,
    pub book_id: BookId,
    pub version: String,
    pub source_format: SourceFormat,
    /// SHA-256 of the sanitized aggregate document.
    pub content_hash: String,
    pub metadata: BookMetadata,
    pub chapters: Vec<ChapterEntry>,
    pub resources: Vec<ResourceEntry>,
    #[serde(default)]
    pub navigation: Vec<NavNode>,
    #[serde(default)]
    pub broken_references: Vec<BrokenReference>,
    pub book_file: String,
    pub word_count: u64,
    pub reading_minutes: u64,
    pub original: OriginalUpload,
    pub created_at: u64,
}

impl StructureDescriptor {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Exact-match chapter lookup.
    pub fn chapter(&self, id: &str) -> Option<&ChapterEntry> {
        self.chapters.iter().find(|c| c.id == id)
    }

    /// Exact-match resource lookup by book-relative path.
    pub fn resource(&self, path: &str) -> Option<&ResourceEntry> {
        self.resources.iter().find(|r| r.path == path)
    }

    pub fn table_of_contents(&self) -> TableOfContents {
        TableOfContents {
            book_id: self.book_id.clone(),
            version: self.version.clone(),
            content_hash: self.content_hash.clone(),
            title: self.metadata.title.clone(),
            authors: self.metadata.authors.clone(),
            language: self.metadata.language.clone(),
            cover: self.metadata.cover.clone(),
            source_format: self.source_format,
            word_count: self.word_count,
            reading_minutes: self.reading_minutes,
            chapters: self
                .chapters
                .iter()
                .map(|c| TocEntry {
                    id: c.id.clone(),
                    index: c.index,
                    title: c.title.clone(),
                    anchor: c.anchor.clone(),
                    word_count: c.word_count,
                    stylesheets: c.stylesheets.clone(),
                })
                .collect(),
            navigation: self.navigation.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub id: String,
    pub index: usize,
    pub title: String,
    pub anchor: String,
    pub word_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stylesheets: Vec<String>,
}

/// Reader-facing view: chapter order and presentational navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOfContents {
    pub book_id: BookId,
    pub version: String,
    pub content_hash: String,
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    pub language: Option<String>,
    /// Resource path of the cover, servable under `resources/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    pub source_format: SourceFormat,
    pub word_count: u64,
    pub reading_minutes: u64,
    pub chapters: Vec<TocEntry>,
    #[serde(default)]
    pub navigation: Vec<NavNode>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample() -> StructureDescriptor {
        let chapter = |i: usize, id: &str| ChapterEntry {
            id: id.to_string(),
            index: i,
            title: format!("Chapter {}", i + 1),
            anchor: format!("chapter-{i}"),
            file: format!("chapters/{i:04}.html"),
            stylesheets: Vec::new(),
            word_count: 10,
            size: 100,
            sha256: "00".repeat(32),
            truncated: false,
        };
        StructureDescriptor {
            schema_version: SCHEMA_VERSION,
            book_id: BookId::parse("sample").unwrap(),
            version: "v1".into(),
            source_format: SourceFormat::Packaged,
            content_hash: "ab".repeat(32),
            metadata: BookMetadata {
                title: Some("Sample".into()),
                ..BookMetadata::default()
            },
            chapters: vec![chapter(0, "intro"), chapter(1, "ch1")],
            resources: vec![ResourceEntry {
                path: "OEBPS/img/a.png".into(),
                file: "resources/OEBPS/img/a.png".into(),
                media_type: "image/png".into(),
                size: 12,
                sha256: "11".repeat(32),
            }],
            navigation: Vec::new(),
            broken_references: Vec::new(),
            book_file: BOOK_FILE.into(),
            word_count: 20,
            reading_minutes: 1,
            original: OriginalUpload {
                filename: "sample.epub".into(),
                file: "original/sample.epub".into(),
                media_type: None,
                size: 1000,
                sha256: "22".repeat(32),
            },
            created_at: 0,
        }
    }

    #[test]
    fn test_lookups_are_exact() {
        let d = sample();
        assert_eq!(d.chapter("ch1").map(|c| c.index), Some(1));
        assert!(d.chapter("CH1").is_none());
        assert!(d.chapter("ch").is_none());
        assert!(d.resource("OEBPS/img/a.png").is_some());
        assert!(d.resource("OEBPS/img/../img/a.png").is_none());
    }

    #[test]
    fn test_json_shape() {
        let d = sample();
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["source_format"], "packaged");
        assert_eq!(json["book_id"], "sample");
        let back = StructureDescriptor::from_json(&serde_json::to_vec(&d).unwrap()).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_table_of_contents_keeps_order() {
        let toc = sample().table_of_contents();
        let ids: Vec<_> = toc.chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["intro", "ch1"]);
        assert_eq!(toc.title.as_deref(), Some("Sample"));
    }
}
