//! Single-document sources: a bare HTML page, plain text, or a zipped HTML bundle.

use scraper::{Html, Selector};

use super::nav::NavPoint;
use super::{
    stylesheet_links, BookMetadata, BookStructure, ChapterSource, ResourceRecord, SourceFormat,
};
use crate::archive::ExtractedArchive;
use crate::error::StructureError;
use crate::media::{classify, decode_text, media_type_for, EntryClass};
use crate::paths::{extension_of, sanitize_filename, ResolvedRef};
use crate::stats::clean_title;

const CHAPTER_ID: &str = "chapter-1";
const HTML_EXTENSIONS: &[&str] = &["html", "htm", "xhtml"];

/// One HTML document treated as a single chapter, plus any bundled assets.
#[derive(Debug)]
pub struct HtmlDocument {
    path: String,
    markup: String,
    title_hint: Option<String>,
    resources: Vec<ResourceRecord>,
    dropped: Vec<String>,
}

impl HtmlDocument {
    pub fn from_markup(filename: &str, markup: &str) -> Self {
        Self {
            path: document_name(filename),
            markup: markup.to_string(),
            title_hint: None,
            resources: Vec::new(),
            dropped: Vec::new(),
        }
    }

    /// Wrap plain text as paragraphs. The first non-blank line becomes the title.
    pub fn from_plain_text(filename: &str, text: &str) -> Self {
        let text = text.replace("\r\n", "\n");
        let title_hint = text.lines().find_map(clean_title);

        let mut markup = String::with_capacity(text.len() + text.len() / 8);
        for paragraph in text.split("\n\n") {
            let lines: Vec<&str> = paragraph
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            if lines.is_empty() {
                continue;
            }
            markup.push_str("<p>");
            for (i, line) in lines.iter().enumerate() {
                if i > 0 {
                    markup.push_str("<br>");
                }
                escape_text(&mut markup, line);
            }
            markup.push_str("</p>\n");
        }

        Self {
            path: document_name(filename),
            markup,
            title_hint,
            resources: Vec::new(),
            dropped: Vec::new(),
        }
    }

    /// Pick the main page of a bundle. Pages named like `index` or `main`
    /// win, shallowest first; otherwise the shallowest page.
    pub fn from_bundle(archive: ExtractedArchive) -> Result<Self, StructureError> {
        let mut pages: Vec<&str> = archive
            .files()
            .map(|e| e.path.as_str())
            .filter(|p| {
                extension_of(p).is_some_and(|ext| HTML_EXTENSIONS.contains(&ext.as_str()))
            })
            .collect();
        pages.sort_by_key(|p| (p.matches('/').count(), *p));

        let main = pages
            .iter()
            .find(|p| {
                let name = p.rsplit('/').next().unwrap_or_default().to_ascii_lowercase();
                name.starts_with("index") || name.starts_with("main")
            })
            .or_else(|| pages.first())
            .map(|p| p.to_string())
            .ok_or(StructureError::NoDocument)?;

        let entry = archive
            .get(&main)
            .ok_or_else(|| StructureError::Malformed(format!("'{main}' is missing")))?;
        let markup = decode_text(&entry.data)
            .ok_or_else(|| StructureError::Malformed(format!("'{main}' is not UTF-8")))?
            .to_string();

        let resources = archive
            .files()
            .filter(|e| {
                matches!(
                    classify(&e.path),
                    Some(EntryClass::Image | EntryClass::Stylesheet)
                )
            })
            .map(|e| ResourceRecord {
                path: e.path.clone(),
                data: e.data.clone(),
                media_type: media_type_for(&e.path).to_string(),
            })
            .collect();

        tracing::debug!(main = %main, pages = pages.len(), "bundle main page selected");
        Ok(Self {
            path: main,
            markup,
            title_hint: None,
            resources,
            dropped: archive.dropped.into_iter().map(|d| d.path).collect(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

pub(super) fn build(doc: HtmlDocument) -> Result<BookStructure, StructureError> {
    let title = doc
        .title_hint
        .clone()
        .or_else(|| document_title(&doc.markup));
    let navigation = heading_outline(&doc.markup, &doc.path);

    let chapter = ChapterSource {
        id: CHAPTER_ID.to_string(),
        index: 0,
        nav_title: title.clone(),
        stylesheets: stylesheet_links(&doc.markup, &doc.path),
        path: doc.path,
        markup: doc.markup,
    };

    Ok(BookStructure {
        source_format: SourceFormat::Html,
        metadata: BookMetadata {
            title,
            ..BookMetadata::default()
        },
        chapters: vec![chapter],
        resources: doc.resources,
        navigation,
        dropped: doc.dropped.into_iter().collect(),
    })
}

fn document_name(filename: &str) -> String {
    let name = sanitize_filename(filename);
    match name.rsplit_once('.') {
        Some((_, ext)) if HTML_EXTENSIONS.contains(&ext) => name,
        Some((stem, _)) => format!("{stem}.html"),
        None => format!("{name}.html"),
    }
}

/// `<title>` if present, else the first heading.
fn document_title(markup: &str) -> Option<String> {
    let document = Html::parse_document(markup);
    let title = Selector::parse("title")
        .ok()
        .and_then(|s| document.select(&s).next())
        .and_then(|t| clean_title(&t.text().collect::<String>()));
    title.or_else(|| {
        let selector = Selector::parse("h1, h2, h3").ok()?;
        let heading = document.select(&selector).next()?;
        clean_title(&heading.text().collect::<String>())
    })
}

/// Flat navigation from top-level headings that carry an `id`.
fn heading_outline(markup: &str, path: &str) -> Vec<NavPoint> {
    let Ok(selector) = Selector::parse("h1[id], h2[id]") else {
        return Vec::new();
    };
    let document = Html::parse_document(markup);
    document
        .select(&selector)
        .filter_map(|h| {
            let title = clean_title(&h.text().collect::<String>())?;
            Some(NavPoint {
                title,
                target: Some(ResolvedRef {
                    path: path.to_string(),
                    fragment: h.value().attr("id").map(String::from),
                }),
                children: Vec::new(),
            })
        })
        .collect()
}

fn escape_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}
