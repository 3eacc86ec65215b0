//! Structure reconstruction: turns extracted entries into an ordered chapter
//! list, a resource set, and a presentational navigation tree.

mod html;
mod nav;
mod package;
mod refs;

pub use html::HtmlDocument;
pub use nav::NavPoint;
pub use package::PackagedBook;

use std::collections::HashSet;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::error::StructureError;
use crate::paths::resolve_reference;
use crate::sanitize::escape_attribute;

/// Source format tag recorded in the descriptor and the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Packaged,
    Html,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Packaged => "packaged",
            SourceFormat::Html => "html",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    pub language: Option<String>,
    pub publisher: Option<String>,
    pub identifier: Option<String>,
    pub description: Option<String>,
    /// Book-relative path of the cover image resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
}

/// An upload interpreted as one of the two supported shapes.
pub enum SourceDocument {
    Packaged(PackagedBook),
    Html(HtmlDocument),
}

/// A stylesheet `<link>` found in a chapter's head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StylesheetLink {
    pub href: String,
    /// Book-relative target, if the href stays inside the book.
    pub path: Option<String>,
}

/// One chapter as found in the source, before sanitization.
#[derive(Debug, Clone)]
pub struct ChapterSource {
    pub id: String,
    pub index: usize,
    /// Book-relative path of the chapter document.
    pub path: String,
    pub nav_title: Option<String>,
    pub markup: String,
    pub stylesheets: Vec<StylesheetLink>,
}

/// A non-text asset stored alongside the chapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub path: String,
    pub data: Vec<u8>,
    pub media_type: String,
}

/// A reference in chapter content that does not resolve inside the book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenReference {
    pub chapter_id: String,
    pub reference: String,
    pub reason: String,
}

/// Navigation entry mapped onto the chapter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavNode {
    pub title: String,
    pub chapter_id: Option<String>,
    pub fragment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NavNode>,
}

/// A sanitized reading unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRecord {
    pub id: String,
    pub index: usize,
    pub title: String,
    pub anchor: String,
    pub content: String,
    pub stylesheets: Vec<String>,
    pub word_count: u64,
    pub truncated: bool,
}

/// Parsed, not yet sanitized book.
#[derive(Debug)]
pub struct BookStructure {
    pub source_format: SourceFormat,
    pub metadata: BookMetadata,
    pub chapters: Vec<ChapterSource>,
    pub resources: Vec<ResourceRecord>,
    pub navigation: Vec<NavPoint>,
    /// Paths the extractor dropped, used to explain broken references.
    pub dropped: HashSet<String>,
}

/// Fully sanitized book, ready to persist.
#[derive(Debug, Clone)]
pub struct SanitizedBook {
    pub source_format: SourceFormat,
    pub metadata: BookMetadata,
    pub chapters: Vec<ChapterRecord>,
    pub resources: Vec<ResourceRecord>,
    pub navigation: Vec<NavNode>,
    pub broken_references: Vec<BrokenReference>,
    /// URL prefix cross-chapter links were qualified with.
    pub chapter_base: String,
}

impl SanitizedBook {
    /// All chapters in order, each wrapped in a section carrying its anchor.
    pub fn aggregate_document(&self) -> String {
        let capacity = self.chapters.iter().map(|c| c.content.len() + 64).sum();
        let mut doc = String::with_capacity(capacity);
        for chapter in &self.chapters {
            doc.push_str("<section class=\"chapter\" id=\"");
            doc.push_str(&chapter.anchor);
            doc.push_str("\">");
            doc.push_str(&self.localize_chapter_links(&chapter.content));
            doc.push_str("</section>");
        }
        doc
    }

    /// Chapter URLs point back into the same document once chapters are joined.
    fn localize_chapter_links(&self, content: &str) -> String {
        if self.chapter_base.is_empty() {
            return content.to_string();
        }
        let mut html = content.to_string();
        for chapter in &self.chapters {
            let url = escape_attribute(&refs::chapter_url(&self.chapter_base, &chapter.id));
            html = html
                .replace(&format!("href=\"{url}#"), "href=\"#")
                .replace(&format!("href=\"{url}\""), &format!("href=\"#{}\"", chapter.anchor));
        }
        html
    }

    pub fn word_count(&self) -> u64 {
        self.chapters.iter().map(|c| c.word_count).sum()
    }
}

/// Build the chapter list and resource set for either source shape.
pub fn build_structure(source: SourceDocument) -> Result<BookStructure, StructureError> {
    let structure = match source {
        SourceDocument::Packaged(book) => package::build(book)?,
        SourceDocument::Html(doc) => html::build(doc)?,
    };
    tracing::debug!(
        format = structure.source_format.as_str(),
        chapters = structure.chapters.len(),
        resources = structure.resources.len(),
        "structure built"
    );
    Ok(structure)
}

/// Stylesheet links in a document's markup, resolved against its path.
pub(crate) fn stylesheet_links(markup: &str, base_path: &str) -> Vec<StylesheetLink> {
    let Ok(selector) = Selector::parse("link[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(markup);
    document
        .select(&selector)
        .filter(|link| {
            link.value().attr("rel").is_some_and(|rel| {
                rel.split_ascii_whitespace()
                    .any(|r| r.eq_ignore_ascii_case("stylesheet"))
            })
        })
        .filter_map(|link| link.value().attr("href"))
        .map(|href| StylesheetLink {
            href: href.to_string(),
            path: resolve_reference(base_path, href).map(|r| r.path),
        })
        .collect()
}

pub(crate) fn anchor_for(index: usize) -> String {
    format!("chapter-{index}")
}
