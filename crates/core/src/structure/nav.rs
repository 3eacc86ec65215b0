//! Navigation documents: the XHTML `<nav>` and the older NCX map.

use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use scraper::{ElementRef, Html, Selector};

use crate::paths::{resolve_reference, ResolvedRef};
use crate::stats::clean_title;

const MAX_NAV_DEPTH: usize = 16;

/// A navigation entry as declared by the source, before it is mapped to chapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavPoint {
    pub title: String,
    pub target: Option<ResolvedRef>,
    pub children: Vec<NavPoint>,
}

impl NavPoint {
    /// Depth-first search for the first entry pointing at `path`.
    pub fn find_title_for(points: &[NavPoint], path: &str) -> Option<String> {
        for point in points {
            if point.target.as_ref().is_some_and(|t| t.path == path) {
                return Some(point.title.clone());
            }
            if let Some(title) = Self::find_title_for(&point.children, path) {
                return Some(title);
            }
        }
        None
    }
}

fn child_elements<'a>(element: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    element.children().filter_map(ElementRef::wrap)
}

/// Parse an XHTML navigation document. Prefers the `toc` nav when several exist.
pub fn parse_nav_document(markup: &str, base_path: &str) -> Vec<NavPoint> {
    let Ok(nav_selector) = Selector::parse("nav") else {
        return Vec::new();
    };
    let document = Html::parse_document(markup);
    let navs: Vec<ElementRef<'_>> = document.select(&nav_selector).collect();
    let is_toc = |nav: &&ElementRef<'_>| {
        let el = nav.value();
        el.attr("epub:type")
            .is_some_and(|t| t.split_ascii_whitespace().any(|t| t == "toc"))
            || el.attr("role") == Some("doc-toc")
    };
    let Some(nav) = navs.iter().find(is_toc).or_else(|| navs.first()) else {
        return Vec::new();
    };

    let points = child_elements(*nav)
        .find(|e| e.value().name() == "ol")
        .map(|ol| walk_list(ol, base_path, 0))
        .unwrap_or_default();
    points
}

fn walk_list(ol: ElementRef<'_>, base_path: &str, depth: usize) -> Vec<NavPoint> {
    let mut points = Vec::new();
    for li in child_elements(ol).filter(|e| e.value().name() == "li") {
        let mut title = None;
        let mut target = None;
        let mut children = Vec::new();

        for child in child_elements(li) {
            match child.value().name() {
                "a" | "span" if title.is_none() => {
                    title = clean_title(&child.text().collect::<String>());
                    target = child
                        .value()
                        .attr("href")
                        .and_then(|href| resolve_reference(base_path, href));
                }
                "ol" if depth < MAX_NAV_DEPTH => {
                    children = walk_list(child, base_path, depth + 1);
                }
                _ => {}
            }
        }

        match title {
            Some(title) => points.push(NavPoint {
                title,
                target,
                children,
            }),
            // Untitled grouping entries lift their children up a level.
            None => points.extend(children),
        }
    }
    points
}

#[derive(Default)]
struct NcxFrame {
    title: String,
    labelled: bool,
    src: Option<String>,
    children: Vec<NavPoint>,
}

/// Parse an NCX `navMap`. Page lists and other maps are ignored.
pub fn parse_ncx(xml: &str, base_path: &str) -> Result<Vec<NavPoint>, quick_xml::Error> {
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();

    let mut roots = Vec::new();
    let mut stack: Vec<NcxFrame> = Vec::new();
    let mut in_nav_map = false;
    let mut label_depth = 0usize;
    let mut in_text = false;
    let mut overflow = 0usize;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"navMap" => in_nav_map = true,
                b"navPoint" if in_nav_map => {
                    if stack.len() >= MAX_NAV_DEPTH {
                        overflow += 1;
                    } else {
                        stack.push(NcxFrame::default());
                    }
                }
                b"navLabel" if !stack.is_empty() => label_depth += 1,
                b"text" if label_depth > 0 => in_text = true,
                b"content" => set_src(&mut stack, e),
                _ => {}
            },
            Event::Empty(ref e) if e.local_name().as_ref() == b"content" => {
                set_src(&mut stack, e);
            }
            Event::Text(ref e) if in_text => {
                // Only the first label of a point names it.
                if let Some(frame) = stack.last_mut().filter(|f| !f.labelled) {
                    frame.title.push_str(&e.unescape()?);
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"navMap" => in_nav_map = false,
                b"text" => in_text = false,
                b"navLabel" => {
                    label_depth = label_depth.saturating_sub(1);
                    if let Some(frame) = stack.last_mut() {
                        frame.labelled = true;
                    }
                }
                b"navPoint" if overflow > 0 => overflow -= 1,
                b"navPoint" => {
                    let Some(frame) = stack.pop() else {
                        buf.clear();
                        continue;
                    };
                    let point = NavPoint {
                        title: clean_title(&frame.title).unwrap_or_default(),
                        target: frame
                            .src
                            .and_then(|src| resolve_reference(base_path, &src)),
                        children: frame.children,
                    };
                    let siblings = match stack.last_mut() {
                        Some(parent) => &mut parent.children,
                        None => &mut roots,
                    };
                    if point.title.is_empty() {
                        siblings.extend(point.children);
                    } else {
                        siblings.push(point);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(roots)
}

fn set_src(stack: &mut [NcxFrame], e: &quick_xml::events::BytesStart<'_>) {
    let Some(frame) = stack.last_mut() else { return };
    if frame.src.is_some() {
        return;
    }
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"src" {
            frame.src = Some(String::from_utf8_lossy(&attr.value).into_owned());
        }
    }
}
