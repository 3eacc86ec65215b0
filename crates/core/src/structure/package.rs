//! Packaged books: container → package document → spine.

use std::collections::{HashMap, HashSet};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;

use super::nav::{parse_nav_document, parse_ncx, NavPoint};
use super::{
    stylesheet_links, BookMetadata, BookStructure, ChapterSource, ResourceRecord, SourceFormat,
};
use crate::archive::ExtractedArchive;
use crate::error::StructureError;
use crate::limits::check_drm;
use crate::media::{classify, decode_text, is_textual_media_type, media_type_for, EntryClass};
use crate::paths::resolve_reference;
use crate::stats::clean_title;

const CONTAINER_PATH: &str = "META-INF/container.xml";
const ENCRYPTION_PATH: &str = "META-INF/encryption.xml";
const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";

#[derive(Debug, Clone)]
struct ManifestItem {
    /// Archive path, resolved against the package document.
    path: Option<String>,
    href: String,
    media_type: String,
    properties: Vec<String>,
}

#[derive(Debug, Default)]
struct PackageDocument {
    metadata: BookMetadata,
    manifest: HashMap<String, ManifestItem>,
    has_manifest: bool,
    spine: Vec<String>,
    toc_id: Option<String>,
    /// Manifest id named by `<meta name="cover">`.
    cover_id: Option<String>,
}

/// An extracted archive whose package document has been located and parsed.
#[derive(Debug)]
pub struct PackagedBook {
    archive: ExtractedArchive,
    package: PackageDocument,
}

impl PackagedBook {
    pub fn open(archive: ExtractedArchive) -> Result<Self, StructureError> {
        if let Some(entry) = archive.get(ENCRYPTION_PATH) {
            check_drm(&String::from_utf8_lossy(&entry.data))?;
        }

        let package_path = find_package_path(&archive)?;
        let text = archive_text(&archive, &package_path)?;
        let package = parse_package(text, &package_path)?;

        if !package.has_manifest || package.manifest.is_empty() {
            return Err(StructureError::Malformed(
                "package document has no manifest".into(),
            ));
        }
        if package.spine.is_empty() {
            return Err(StructureError::Malformed("spine is empty".into()));
        }

        tracing::debug!(
            package = %package_path,
            manifest = package.manifest.len(),
            spine = package.spine.len(),
            "package document parsed"
        );
        Ok(Self { archive, package })
    }

    pub fn title(&self) -> Option<&str> {
        self.package.metadata.title.as_deref()
    }

    fn navigation(&self) -> Vec<NavPoint> {
        let manifest = &self.package.manifest;
        let nav_doc = manifest
            .values()
            .find(|item| item.properties.iter().any(|p| p == "nav"))
            .and_then(|item| item.path.as_deref());
        if let Some(path) = nav_doc {
            if let Some(text) = self.archive.get(path).and_then(|e| decode_text(&e.data)) {
                let points = parse_nav_document(text, path);
                if !points.is_empty() {
                    return points;
                }
            }
        }

        let ncx = self
            .package
            .toc_id
            .as_ref()
            .and_then(|id| manifest.get(id))
            .or_else(|| manifest.values().find(|i| i.media_type == NCX_MEDIA_TYPE))
            .and_then(|item| item.path.as_deref());
        let Some(path) = ncx else {
            return Vec::new();
        };
        let Some(text) = self.archive.get(path).and_then(|e| decode_text(&e.data)) else {
            return Vec::new();
        };
        match parse_ncx(text, path) {
            Ok(points) => points,
            Err(e) => {
                tracing::warn!(path, error = %e, "ignoring unreadable NCX");
                Vec::new()
            }
        }
    }
}

pub(super) fn build(book: PackagedBook) -> Result<BookStructure, StructureError> {
    let navigation = book.navigation();
    let mut chapters = Vec::new();
    let mut used_ids = HashSet::new();

    for idref in &book.package.spine {
        let item = book.package.manifest.get(idref).ok_or_else(|| {
            StructureError::Malformed(format!("spine references unknown item '{idref}'"))
        })?;
        if !is_textual_media_type(&item.media_type) {
            tracing::debug!(href = %item.href, media_type = %item.media_type, "non-text spine item kept as resource");
            continue;
        }
        let path = item.path.as_deref().ok_or_else(|| {
            StructureError::Malformed(format!("spine item '{}' points outside the book", item.href))
        })?;

        let entry = book.archive.get(path).ok_or_else(|| {
            StructureError::Malformed(format!("spine document '{path}' is missing"))
        })?;
        let markup = decode_text(&entry.data).ok_or_else(|| {
            StructureError::Malformed(format!("spine document '{path}' is not UTF-8"))
        })?;

        let mut id = idref.clone();
        let mut n = 2;
        while !used_ids.insert(id.clone()) {
            id = format!("{idref}-{n}");
            n += 1;
        }

        chapters.push(ChapterSource {
            id,
            index: chapters.len(),
            path: path.to_string(),
            nav_title: NavPoint::find_title_for(&navigation, path),
            stylesheets: stylesheet_links(markup, path),
            markup: markup.to_string(),
        });
    }

    if chapters.is_empty() {
        return Err(StructureError::Malformed(
            "spine has no readable documents".into(),
        ));
    }

    let resources: Vec<ResourceRecord> = book
        .archive
        .files()
        .filter(|e| matches!(classify(&e.path), Some(EntryClass::Image | EntryClass::Stylesheet)))
        .map(|e| ResourceRecord {
            path: e.path.clone(),
            data: e.data.clone(),
            media_type: media_type_for(&e.path).to_string(),
        })
        .collect();

    let PackagedBook { archive, mut package } = book;
    package.metadata.cover = find_cover(&package, &resources);

    Ok(BookStructure {
        source_format: SourceFormat::Packaged,
        metadata: package.metadata,
        chapters,
        resources,
        navigation,
        dropped: archive.dropped.into_iter().map(|d| d.path).collect(),
    })
}

/// Cover image path: the `cover-image` manifest property, then the item named
/// by `<meta name="cover">`, then the first image whose file name mentions
/// "cover". Only images that survived extraction qualify.
fn find_cover(package: &PackageDocument, resources: &[ResourceRecord]) -> Option<String> {
    let is_image = |path: &str| {
        resources
            .iter()
            .any(|r| r.path == path && r.media_type.starts_with("image/"))
    };

    let mut by_property: Vec<&str> = package
        .manifest
        .values()
        .filter(|item| item.properties.iter().any(|p| p == "cover-image"))
        .filter_map(|item| item.path.as_deref())
        .filter(|path| is_image(path))
        .collect();
    by_property.sort_unstable();
    if let Some(path) = by_property.first() {
        return Some(path.to_string());
    }

    let by_meta = package
        .cover_id
        .as_ref()
        .and_then(|id| package.manifest.get(id))
        .and_then(|item| item.path.as_deref())
        .filter(|path| is_image(path));
    if let Some(path) = by_meta {
        return Some(path.to_string());
    }

    resources
        .iter()
        .filter(|r| r.media_type.starts_with("image/"))
        .find(|r| {
            let name = r.path.rsplit('/').next().unwrap_or(&r.path);
            name.to_ascii_lowercase().contains("cover")
        })
        .map(|r| r.path.clone())
}

fn archive_text<'a>(archive: &'a ExtractedArchive, path: &str) -> Result<&'a str, StructureError> {
    let entry = archive
        .get(path)
        .ok_or_else(|| StructureError::Malformed(format!("'{path}' is missing")))?;
    decode_text(&entry.data)
        .ok_or_else(|| StructureError::Malformed(format!("'{path}' is not UTF-8")))
}

fn find_package_path(archive: &ExtractedArchive) -> Result<String, StructureError> {
    let container = archive_text(archive, CONTAINER_PATH)?;
    let mut reader = XmlReader::from_str(container);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                if let Some(full_path) = attribute(e, b"full-path") {
                    return crate::paths::normalize_entry_path(&full_path).map_err(|reason| {
                        StructureError::Malformed(format!(
                            "container rootfile '{full_path}' is invalid: {reason}"
                        ))
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StructureError::Malformed(format!(
                    "failed to parse container.xml: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Err(StructureError::Malformed(
        "no rootfile found in container.xml".into(),
    ))
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name)
        .map(|attr| match attr.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        })
}

fn manifest_item(e: &BytesStart<'_>, href: String, package_path: &str) -> ManifestItem {
    let path = resolve_reference(package_path, &href).map(|r| r.path);
    if path.is_none() {
        tracing::warn!(href = %href, "manifest item points outside the book");
    }
    ManifestItem {
        path,
        media_type: attribute(e, b"media-type").unwrap_or_default(),
        properties: attribute(e, b"properties")
            .map(|p| p.split_ascii_whitespace().map(String::from).collect())
            .unwrap_or_default(),
        href,
    }
}

fn parse_package(content: &str, package_path: &str) -> Result<PackageDocument, StructureError> {
    let mut reader = XmlReader::from_str(content);
    let mut buf = Vec::new();
    let mut doc = PackageDocument::default();

    let mut in_metadata = false;
    let mut current: Option<String> = None;
    let mut text = String::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            StructureError::Malformed(format!("failed to parse package document: {e}"))
        })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                match e.local_name().as_ref() {
                    b"metadata" => in_metadata = is_start,
                    b"title" | b"creator" | b"language" | b"publisher" | b"identifier"
                    | b"description"
                        if in_metadata && is_start =>
                    {
                        current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                        text.clear();
                    }
                    b"meta" if in_metadata => {
                        if attribute(e, b"name").as_deref() == Some("cover") {
                            doc.cover_id = attribute(e, b"content");
                        }
                    }
                    b"manifest" => doc.has_manifest = true,
                    b"item" => {
                        if let (Some(id), Some(href)) = (attribute(e, b"id"), attribute(e, b"href")) {
                            doc.manifest.insert(id, manifest_item(e, href, package_path));
                        }
                    }
                    b"spine" => doc.toc_id = attribute(e, b"toc"),
                    b"itemref" => {
                        let linear = attribute(e, b"linear");
                        if let Some(idref) = attribute(e, b"idref") {
                            if linear.as_deref() == Some("no") {
                                tracing::debug!(idref = %idref, "non-linear spine item");
                            }
                            doc.spine.push(idref);
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref e) if current.is_some() => {
                if let Ok(t) = e.unescape() {
                    text.push_str(&t);
                }
            }
            Event::End(ref e) => {
                if e.local_name().as_ref() == b"metadata" {
                    in_metadata = false;
                }
                if let Some(element) = current.take() {
                    if let Some(value) = clean_title(&text) {
                        let meta = &mut doc.metadata;
                        match element.as_str() {
                            "title" if meta.title.is_none() => meta.title = Some(value),
                            "creator" => meta.authors.push(value),
                            "language" if meta.language.is_none() => meta.language = Some(value),
                            "publisher" if meta.publisher.is_none() => {
                                meta.publisher = Some(value)
                            }
                            "identifier" if meta.identifier.is_none() => {
                                meta.identifier = Some(value)
                            }
                            "description" if meta.description.is_none() => {
                                meta.description = Some(value)
                            }
                            _ => {}
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::extract_archive;
    use crate::limits::IngestLimits;
    use crate::testkit::{EpubBuilder, ZipBuilder, TINY_PNG};
    use crate::error::ErrorKind;

    fn open(bytes: &[u8]) -> Result<PackagedBook, StructureError> {
        PackagedBook::open(extract_archive(bytes, &IngestLimits::default()).unwrap())
    }

    fn structure(bytes: &[u8]) -> BookStructure {
        build(open(bytes).unwrap()).unwrap()
    }

    #[test]
    fn test_spine_order_and_metadata() {
        let bytes = EpubBuilder::new("A Tale")
            .author("Ann Author")
            .titled_chapter("c1", "text/one.xhtml", "Opening", "<p>one</p>")
            .chapter("c2", "text/two.xhtml", "<h1>Two</h1>")
            .build();

        let book = structure(&bytes);
        assert_eq!(book.source_format, SourceFormat::Packaged);
        assert_eq!(book.metadata.title.as_deref(), Some("A Tale"));
        assert_eq!(book.metadata.authors, vec!["Ann Author".to_string()]);
        assert_eq!(book.metadata.identifier.as_deref(), Some("urn:uuid:test"));

        let ids: Vec<_> = book.chapters.iter().map(|c| (c.index, c.id.as_str())).collect();
        assert_eq!(ids, vec![(0, "c1"), (1, "c2")]);
        assert_eq!(book.chapters[0].path, "OEBPS/text/one.xhtml");
        assert_eq!(book.chapters[0].nav_title.as_deref(), Some("Opening"));
        assert_eq!(book.chapters[1].nav_title, None);
    }

    #[test]
    fn test_cover_from_manifest_property() {
        let bytes = EpubBuilder::new("Covered")
            .chapter("c1", "c1.xhtml", "<p>x</p>")
            .resource("img/cover-old.png", "image/png", TINY_PNG)
            .cover_image("img/front.png", "image/png", TINY_PNG)
            .build();
        let book = structure(&bytes);
        assert_eq!(book.metadata.cover.as_deref(), Some("OEBPS/img/front.png"));
    }

    #[test]
    fn test_cover_from_meta_element() {
        let bytes = EpubBuilder::new("Covered")
            .chapter("c1", "c1.xhtml", "<p>x</p>")
            .cover_meta("img/front.png", "image/png", TINY_PNG)
            .build();
        let book = structure(&bytes);
        assert_eq!(book.metadata.cover.as_deref(), Some("OEBPS/img/front.png"));
    }

    #[test]
    fn test_cover_from_file_name() {
        let bytes = EpubBuilder::new("Covered")
            .chapter("c1", "c1.xhtml", "<p>x</p>")
            .resource("img/plate.png", "image/png", TINY_PNG)
            .resource("img/Cover.png", "image/png", TINY_PNG)
            .build();
        let book = structure(&bytes);
        assert_eq!(book.metadata.cover.as_deref(), Some("OEBPS/img/Cover.png"));

        let bare = EpubBuilder::new("Bare")
            .chapter("c1", "c1.xhtml", "<p>x</p>")
            .resource("img/plate.png", "image/png", TINY_PNG)
            .build();
        assert_eq!(structure(&bare).metadata.cover, None);
    }

    #[test]
    fn test_nav_order_does_not_reorder_spine() {
        let bytes = EpubBuilder::new("Order")
            .titled_chapter("a", "a.xhtml", "A", "<p>a</p>")
            .titled_chapter("b", "b.xhtml", "B", "<p>b</p>")
            .nav_order(&["b", "a"])
            .build();
        let book = structure(&bytes);
        assert_eq!(book.chapters[0].id, "a");
        assert_eq!(book.navigation[0].title, "B");
    }

    #[test]
    fn test_ncx_used_without_nav_document() {
        let bytes = EpubBuilder::new("Old")
            .titled_chapter("c1", "c1.xhtml", "From NCX", "<p>x</p>")
            .without_nav()
            .with_ncx()
            .build();
        let book = structure(&bytes);
        assert_eq!(book.chapters[0].nav_title.as_deref(), Some("From NCX"));
    }

    #[test]
    fn test_resources_and_stylesheets() {
        let bytes = EpubBuilder::new("Styled")
            .chapter("c1", "text/c1.xhtml", "<p>x</p>")
            .stylesheet("css/book.css", "p { color: red }")
            .resource("img/pic.png", "image/png", TINY_PNG)
            .build();
        let book = structure(&bytes);
        let paths: HashSet<_> = book.resources.iter().map(|r| r.path.as_str()).collect();
        assert!(paths.contains("OEBPS/css/book.css"));
        assert!(paths.contains("OEBPS/img/pic.png"));
        assert_eq!(
            book.chapters[0].stylesheets[0].path.as_deref(),
            Some("OEBPS/css/book.css")
        );
    }

    #[test]
    fn test_image_spine_item_is_not_a_chapter() {
        let bytes = EpubBuilder::new("Pictures")
            .chapter("c1", "c1.xhtml", "<p>x</p>")
            .spine_resource("plate", "plate.png", "image/png", TINY_PNG)
            .chapter("c2", "c2.xhtml", "<p>y</p>")
            .build();
        let book = structure(&bytes);
        let indexes: Vec<_> = book.chapters.iter().map(|c| c.index).collect();
        assert_eq!(indexes, vec![0, 1]);
        assert!(book.resources.iter().any(|r| r.path == "OEBPS/plate.png"));
    }

    #[test]
    fn test_missing_container_is_malformed() {
        let bytes = ZipBuilder::new().file("OEBPS/c1.xhtml", b"<p/>").finish();
        let err = open(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPackage);
    }

    fn package_zip(opf: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipBuilder::new()
            .file(
                "META-INF/container.xml",
                br#"<container><rootfiles><rootfile full-path="content.opf"/></rootfiles></container>"#,
            )
            .file("content.opf", opf.as_bytes());
        for (name, data) in files {
            zip = zip.file(name, data);
        }
        zip.finish()
    }

    #[test]
    fn test_missing_spine_document_is_malformed() {
        let opf = r#"<package><metadata/><manifest>
            <item id="a" href="a.xhtml" media-type="application/xhtml+xml"/>
            </manifest><spine><itemref idref="a"/></spine></package>"#;
        let err = build(open(&package_zip(opf, &[])).unwrap()).unwrap_err();
        assert!(err.to_string().contains("missing"), "{err}");
    }

    #[test]
    fn test_unknown_idref_is_malformed() {
        let opf = r#"<package xmlns="http://www.idpf.org/2007/opf"><metadata/>
            <manifest><item id="a" href="a.xhtml" media-type="application/xhtml+xml"/></manifest>
            <spine><itemref idref="ghost"/></spine></package>"#;
        let bytes = package_zip(opf, &[("a.xhtml", b"<p>a</p>")]);
        let err = build(open(&bytes).unwrap()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_empty_spine_is_malformed() {
        let opf = r#"<package><metadata/><manifest>
            <item id="a" href="a.xhtml" media-type="application/xhtml+xml"/>
            </manifest><spine/></package>"#;
        let bytes = package_zip(opf, &[]);
        assert!(matches!(open(&bytes), Err(StructureError::Malformed(_))));
    }

    #[test]
    fn test_drm_rejected() {
        let bytes = EpubBuilder::new("Locked")
            .chapter("c1", "c1.xhtml", "<p>x</p>")
            .encryption(
                r#"<encryption><EncryptedData><KeyInfo><resource xmlns="http://ns.adobe.com/adept"/></KeyInfo></EncryptedData></encryption>"#,
            )
            .build();
        let err = open(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_duplicate_idrefs_get_unique_ids() {
        let opf = r#"<package><metadata/><manifest>
            <item id="a" href="a.xhtml" media-type="application/xhtml+xml"/>
            </manifest><spine><itemref idref="a"/><itemref idref="a"/></spine></package>"#;
        let bytes = package_zip(opf, &[("a.xhtml", b"<p>a</p>")]);
        let book = structure(&bytes);
        let ids: Vec<_> = book.chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a-2"]);
    }
}
