//! Reference rewriting and per-chapter sanitization.
//!
//! Every `href`/`src`/`cite` left after scheme filtering is resolved against
//! the chapter that holds it. Links into another chapter become chapter URLs,
//! stored resources become server URLs, and anything else is reported as
//! broken.

use std::collections::{HashMap, HashSet};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::nav::NavPoint;
use super::{
    anchor_for, BookStructure, BrokenReference, ChapterRecord, NavNode, ResourceRecord,
    SanitizedBook,
};
use crate::error::SanitizeError;
use crate::media::{classify, EntryClass};
use crate::paths::{has_scheme, resolve_reference};
use crate::sanitize::{sanitize_stylesheet, Sanitizer, UrlPolicy};
use crate::stats::{count_words, first_heading, fragment_text};

/// Characters left as-is in a resource URL path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const EXTERNAL_LINK_SCHEMES: &[&str] = &["http:", "https:", "mailto:"];

/// URL under which a stored resource is served.
pub fn resource_url(resource_base: &str, path: &str) -> String {
    let mut url = resource_base.trim_end_matches('/').to_string();
    for segment in path.split('/') {
        url.push('/');
        url.extend(utf8_percent_encode(segment, SEGMENT));
    }
    url
}

/// URL under which a chapter fragment is served.
pub fn chapter_url(chapter_base: &str, chapter_id: &str) -> String {
    format!(
        "{}/{}",
        chapter_base.trim_end_matches('/'),
        utf8_percent_encode(chapter_id, SEGMENT)
    )
}

struct ReferencePolicy<'a> {
    chapter_id: &'a str,
    chapter_index: usize,
    base_path: &'a str,
    chapters: &'a HashMap<String, usize>,
    chapter_ids: &'a [String],
    chapter_base: &'a str,
    resources: &'a HashSet<String>,
    dropped: &'a HashSet<String>,
    resource_base: &'a str,
    broken: Vec<BrokenReference>,
}

impl ReferencePolicy<'_> {
    fn broken(&mut self, reference: &str, reason: &str) -> Option<String> {
        tracing::debug!(chapter = self.chapter_id, reference, reason, "broken reference");
        self.broken.push(BrokenReference {
            chapter_id: self.chapter_id.to_string(),
            reference: reference.to_string(),
            reason: reason.to_string(),
        });
        None
    }
}

impl UrlPolicy for ReferencePolicy<'_> {
    fn rewrite(&mut self, _element: &str, attribute: &str, value: &str) -> Option<String> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if value.starts_with('#') {
            return Some(value.to_string());
        }

        let embeds = attribute == "src";
        if has_scheme(value) || value.starts_with("//") {
            let lower = value.to_ascii_lowercase();
            if !embeds && EXTERNAL_LINK_SCHEMES.iter().any(|s| lower.starts_with(s)) {
                return Some(value.to_string());
            }
            return self.broken(value, "external content is not embedded");
        }

        let Some(target) = resolve_reference(self.base_path, value) else {
            return self.broken(value, "reference leaves the book");
        };

        if let Some(&index) = self.chapters.get(&target.path) {
            if embeds {
                return self.broken(value, "chapter documents cannot be embedded");
            }
            return Some(match target.fragment {
                Some(fragment) if index == self.chapter_index => format!("#{fragment}"),
                fragment => {
                    let id = self.chapter_ids.get(index).map_or(self.chapter_id, String::as_str);
                    let mut url = chapter_url(self.chapter_base, id);
                    if let Some(fragment) = fragment {
                        url.push('#');
                        url.push_str(&fragment);
                    }
                    url
                }
            });
        }

        if self.resources.contains(&target.path) {
            let mut url = resource_url(self.resource_base, &target.path);
            if let Some(fragment) = target.fragment {
                url.push('#');
                url.push_str(&fragment);
            }
            return Some(url);
        }

        if self.dropped.contains(&target.path) {
            self.broken(value, "resource was dropped during extraction")
        } else {
            self.broken(value, "missing from the book")
        }
    }
}

impl BookStructure {
    /// Sanitize every chapter, rewrite references, and neutralize stylesheets.
    ///
    /// `book_base` is the URL prefix this book is served under, e.g.
    /// `/api/books/moby-dick`; resources live below `resources/` and chapters
    /// below `chapters/`.
    pub fn sanitize(
        self,
        sanitizer: &Sanitizer,
        book_base: &str,
    ) -> Result<SanitizedBook, SanitizeError> {
        let book_base = book_base.trim_end_matches('/');
        let resource_base = format!("{book_base}/resources");
        let chapter_base = format!("{book_base}/chapters");
        let chapter_paths: HashMap<String, usize> = self
            .chapters
            .iter()
            .map(|c| (c.path.clone(), c.index))
            .collect();
        let chapter_ids: Vec<String> = self.chapters.iter().map(|c| c.id.clone()).collect();
        let resource_paths: HashSet<String> =
            self.resources.iter().map(|r| r.path.clone()).collect();

        let mut broken_references = Vec::new();
        let mut chapters = Vec::with_capacity(self.chapters.len());

        for source in self.chapters {
            let mut policy = ReferencePolicy {
                chapter_id: &source.id,
                chapter_index: source.index,
                base_path: &source.path,
                chapters: &chapter_paths,
                chapter_ids: &chapter_ids,
                chapter_base: &chapter_base,
                resources: &resource_paths,
                dropped: &self.dropped,
                resource_base: &resource_base,
                broken: Vec::new(),
            };
            let sanitized = sanitizer.sanitize_with(&source.markup, &mut policy)?;
            broken_references.append(&mut policy.broken);

            if sanitized.truncated {
                tracing::warn!(chapter = %source.id, "chapter truncated to size limit");
            }

            let mut stylesheets = Vec::new();
            for link in &source.stylesheets {
                match &link.path {
                    Some(path)
                        if resource_paths.contains(path)
                            && classify(path) == Some(EntryClass::Stylesheet) =>
                    {
                        stylesheets.push(path.clone());
                    }
                    _ => broken_references.push(BrokenReference {
                        chapter_id: source.id.clone(),
                        reference: link.href.clone(),
                        reason: "stylesheet is not part of the book".to_string(),
                    }),
                }
            }

            let title = source
                .nav_title
                .or_else(|| first_heading(&sanitized.html))
                .unwrap_or_else(|| format!("Chapter {}", source.index + 1));

            chapters.push(ChapterRecord {
                word_count: count_words(&fragment_text(&sanitized.html)),
                id: source.id,
                index: source.index,
                title,
                anchor: anchor_for(source.index),
                content: sanitized.html,
                stylesheets,
                truncated: sanitized.truncated,
            });
        }

        let resources = self
            .resources
            .into_iter()
            .map(|resource| match classify(&resource.path) {
                Some(EntryClass::Stylesheet) => ResourceRecord {
                    data: sanitize_stylesheet(&String::from_utf8_lossy(&resource.data))
                        .into_bytes(),
                    ..resource
                },
                _ => resource,
            })
            .collect();

        let navigation = map_navigation(&self.navigation, &chapter_paths, &chapter_ids);

        Ok(SanitizedBook {
            source_format: self.source_format,
            metadata: self.metadata,
            chapters,
            resources,
            navigation,
            broken_references,
            chapter_base,
        })
    }
}

fn map_navigation(
    points: &[NavPoint],
    chapter_paths: &HashMap<String, usize>,
    chapter_ids: &[String],
) -> Vec<NavNode> {
    points
        .iter()
        .map(|point| {
            let target = point.target.as_ref();
            NavNode {
                title: point.title.clone(),
                chapter_id: target
                    .and_then(|t| chapter_paths.get(&t.path))
                    .and_then(|&i| chapter_ids.get(i))
                    .cloned(),
                fragment: target.and_then(|t| t.fragment.clone()),
                children: map_navigation(&point.children, chapter_paths, chapter_ids),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::extract_archive;
    use crate::limits::IngestLimits;
    use crate::structure::{build_structure, PackagedBook, SourceDocument};
    use crate::testkit::{EpubBuilder, TINY_PNG};
    use pretty_assertions::assert_eq;

    const BASE: &str = "/api/books/b1";

    fn sanitize_epub(bytes: &[u8]) -> SanitizedBook {
        let limits = IngestLimits::default();
        let archive = extract_archive(bytes, &limits).unwrap();
        let source = SourceDocument::Packaged(PackagedBook::open(archive).unwrap());
        build_structure(source)
            .unwrap()
            .sanitize(&Sanitizer::for_chapters(&limits), BASE)
            .unwrap()
    }

    #[test]
    fn test_resource_url_encodes_segments() {
        assert_eq!(
            resource_url("/api/books/x/resources/", "OEBPS/img dir/a#b.png"),
            "/api/books/x/resources/OEBPS/img%20dir/a%23b.png"
        );
    }

    #[test]
    fn test_references_rewritten() {
        let bytes = EpubBuilder::new("Links")
            .chapter(
                "c1",
                "text/c1.xhtml",
                r##"<p><a href="c2.xhtml">next</a> <a href="c2.xhtml#s2">deep</a>
                <a href="#top">top</a> <a href="https://example.com/x">web</a>
                <img src="../img/pic.png" alt="pic"/></p>"##,
            )
            .chapter("c2", "text/c2.xhtml", "<h2 id=\"s2\">Two</h2>")
            .resource("img/pic.png", "image/png", TINY_PNG)
            .build();

        let book = sanitize_epub(&bytes);
        let html = &book.chapters[0].content;
        assert!(html.contains(r#"href="/api/books/b1/chapters/c2""#), "{html}");
        assert!(html.contains(r#"href="/api/books/b1/chapters/c2#s2""#), "{html}");
        assert!(html.contains(r##"href="#top""##), "{html}");
        assert!(html.contains(r#"href="https://example.com/x""#), "{html}");
        assert!(
            html.contains(r#"src="/api/books/b1/resources/OEBPS/img/pic.png""#),
            "{html}"
        );
        assert!(book.broken_references.is_empty(), "{:?}", book.broken_references);
    }

    #[test]
    fn test_chapter_links_resolve_inside_aggregate() {
        let bytes = EpubBuilder::new("Links")
            .chapter(
                "c1",
                "c1.xhtml",
                r#"<p><a href="c2.xhtml">next</a> <a href="c2.xhtml#s2">deep</a> <a href="c1.xhtml#me">self</a></p>"#,
            )
            .chapter("c2", "c2.xhtml", "<h2 id=\"s2\">Two</h2>")
            .build();

        let book = sanitize_epub(&bytes);
        assert!(book.chapters[0].content.contains(r##"href="#me""##));
        let aggregate = book.aggregate_document();
        assert!(aggregate.contains(r##"href="#chapter-1""##), "{aggregate}");
        assert!(aggregate.contains(r##"href="#s2""##), "{aggregate}");
        assert!(!aggregate.contains("/chapters/"), "{aggregate}");
    }

    #[test]
    fn test_chapter_url_encodes_id() {
        assert_eq!(chapter_url("/api/books/x/chapters/", "part 1"), "/api/books/x/chapters/part%201");
    }

    #[test]
    fn test_broken_references_reported_not_fatal() {
        let bytes = EpubBuilder::new("Broken")
            .chapter(
                "c1",
                "c1.xhtml",
                r#"<p><img src="missing.png"/><img src="fonts/x.otf"/>
                <img src="http://tracker.example/pixel.gif"/><a href="../../../etc/passwd">x</a></p>"#,
            )
            .raw_file("OEBPS/fonts/x.otf", b"font")
            .build();

        let book = sanitize_epub(&bytes);
        let html = &book.chapters[0].content;
        assert!(!html.contains("src="), "{html}");
        assert!(!html.contains("passwd"), "{html}");

        let reasons: Vec<(&str, &str)> = book
            .broken_references
            .iter()
            .map(|b| (b.reference.as_str(), b.reason.as_str()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("missing.png", "missing from the book"),
                ("fonts/x.otf", "resource was dropped during extraction"),
                ("http://tracker.example/pixel.gif", "external content is not embedded"),
                ("../../../etc/passwd", "reference leaves the book"),
            ]
        );
    }

    #[test]
    fn test_titles_and_word_counts() {
        let bytes = EpubBuilder::new("Titles")
            .titled_chapter("c1", "c1.xhtml", "From Nav", "<h1>Heading</h1><p>one two</p>")
            .chapter("c2", "c2.xhtml", "<h1>Second Heading</h1><p>three</p>")
            .chapter("c3", "c3.xhtml", "<p>no heading here</p>")
            .build();

        let book = sanitize_epub(&bytes);
        let titles: Vec<_> = book.chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["From Nav", "Second Heading", "Chapter 3"]);
        assert_eq!(book.chapters[0].word_count, 3);
        assert_eq!(book.chapters[2].anchor, "chapter-2");
        assert_eq!(book.navigation[0].chapter_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_stylesheets_neutralized_and_linked() {
        let bytes = EpubBuilder::new("Styles")
            .chapter("c1", "text/c1.xhtml", "<p>x</p>")
            .stylesheet(
                "css/book.css",
                "@import url(http://evil.example/x.css); p { background: url(javascript:alert(1)) }",
            )
            .build();

        let book = sanitize_epub(&bytes);
        assert_eq!(book.chapters[0].stylesheets, vec!["OEBPS/css/book.css".to_string()]);
        let css = book
            .resources
            .iter()
            .find(|r| r.path == "OEBPS/css/book.css")
            .map(|r| String::from_utf8_lossy(&r.data).into_owned())
            .unwrap();
        assert!(!css.contains("@import"), "{css}");
        assert!(!css.contains("javascript"), "{css}");
    }

    #[test]
    fn test_script_content_removed_from_chapters() {
        let bytes = EpubBuilder::new("Hostile")
            .chapter(
                "c1",
                "c1.xhtml",
                r#"<p onclick="steal()">safe</p><script>steal()</script><a href="javascript:steal()">x</a>"#,
            )
            .build();
        let book = sanitize_epub(&bytes);
        let html = &book.chapters[0].content;
        assert!(!html.contains("steal"), "{html}");
        assert!(html.contains("safe"));
    }
}
