//! In-memory ZIP and EPUB fixtures for tests.
//!
//! Compiled for this crate's tests and, through the `testkit` feature, for the
//! server and CLI test suites.

use std::io::{Cursor, Write};

type Options = zip::write::FileOptions<'static, ()>;

fn deflated() -> Options {
    zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated)
}

fn stored() -> Options {
    zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored)
}

/// Raw ZIP builder that writes entry names exactly as given.
pub struct ZipBuilder {
    zip: zip::ZipWriter<Cursor<Vec<u8>>>,
}

impl Default for ZipBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self {
            zip: zip::ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        self.zip.start_file(name, deflated()).expect("start zip entry");
        self.zip.write_all(data).expect("write zip entry");
        self
    }

    pub fn stored_file(mut self, name: &str, data: &[u8]) -> Self {
        self.zip.start_file(name, stored()).expect("start zip entry");
        self.zip.write_all(data).expect("write zip entry");
        self
    }

    pub fn dir(mut self, name: &str) -> Self {
        self.zip.add_directory(name, deflated()).expect("add zip directory");
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        self.zip
            .add_symlink(name, target, deflated())
            .expect("add zip symlink");
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.zip.finish().expect("finish zip").into_inner()
    }
}

#[derive(Clone, Copy)]
enum CoverMarker {
    Property,
    Meta,
}

struct Chapter {
    id: String,
    href: String,
    nav_title: Option<String>,
    body: String,
}

/// Builds a minimal EPUB 3 package under `OEBPS/`.
pub struct EpubBuilder {
    title: String,
    authors: Vec<String>,
    language: String,
    chapters: Vec<Chapter>,
    nav_order: Option<Vec<String>>,
    stylesheet: Option<(String, String)>,
    resources: Vec<(String, String, Vec<u8>)>,
    spine_resources: Vec<(String, String, String, Vec<u8>)>,
    raw_files: Vec<(String, Vec<u8>)>,
    encryption: Option<String>,
    cover: Option<(CoverMarker, String, String, Vec<u8>)>,
    with_nav: bool,
    with_ncx: bool,
}

/// A valid 1x1 PNG.
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

impl EpubBuilder {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            authors: Vec::new(),
            language: "en".to_string(),
            chapters: Vec::new(),
            nav_order: None,
            stylesheet: None,
            resources: Vec::new(),
            spine_resources: Vec::new(),
            raw_files: Vec::new(),
            encryption: None,
            cover: None,
            with_nav: true,
            with_ncx: false,
        }
    }

    pub fn author(mut self, name: &str) -> Self {
        self.authors.push(name.to_string());
        self
    }

    /// Spine chapter without a navigation entry.
    pub fn chapter(mut self, id: &str, href: &str, body: &str) -> Self {
        self.chapters.push(Chapter {
            id: id.to_string(),
            href: href.to_string(),
            nav_title: None,
            body: body.to_string(),
        });
        self
    }

    /// Spine chapter listed in the navigation document under `nav_title`.
    pub fn titled_chapter(mut self, id: &str, href: &str, nav_title: &str, body: &str) -> Self {
        self.chapters.push(Chapter {
            id: id.to_string(),
            href: href.to_string(),
            nav_title: Some(nav_title.to_string()),
            body: body.to_string(),
        });
        self
    }

    /// List navigation entries in this chapter-id order instead of spine order.
    pub fn nav_order(mut self, ids: &[&str]) -> Self {
        self.nav_order = Some(ids.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Stylesheet linked from every chapter's head.
    pub fn stylesheet(mut self, href: &str, css: &str) -> Self {
        self.stylesheet = Some((href.to_string(), css.to_string()));
        self
    }

    pub fn resource(mut self, href: &str, media_type: &str, data: &[u8]) -> Self {
        self.resources
            .push((href.to_string(), media_type.to_string(), data.to_vec()));
        self
    }

    /// Non-text item placed in the spine after the chapters.
    pub fn spine_resource(mut self, id: &str, href: &str, media_type: &str, data: &[u8]) -> Self {
        self.spine_resources.push((
            id.to_string(),
            href.to_string(),
            media_type.to_string(),
            data.to_vec(),
        ));
        self
    }

    /// Extra archive entry written verbatim, name included.
    pub fn raw_file(mut self, name: &str, data: &[u8]) -> Self {
        self.raw_files.push((name.to_string(), data.to_vec()));
        self
    }

    /// Cover image declared with the EPUB 3 `cover-image` manifest property.
    pub fn cover_image(mut self, href: &str, media_type: &str, data: &[u8]) -> Self {
        self.cover = Some((CoverMarker::Property, href.into(), media_type.into(), data.to_vec()));
        self
    }

    /// Cover image declared with an EPUB 2 `<meta name="cover">` element.
    pub fn cover_meta(mut self, href: &str, media_type: &str, data: &[u8]) -> Self {
        self.cover = Some((CoverMarker::Meta, href.into(), media_type.into(), data.to_vec()));
        self
    }

    pub fn encryption(mut self, xml: &str) -> Self {
        self.encryption = Some(xml.to_string());
        self
    }

    pub fn without_nav(mut self) -> Self {
        self.with_nav = false;
        self
    }

    pub fn with_ncx(mut self) -> Self {
        self.with_ncx = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut zip = ZipBuilder::new()
            .stored_file("mimetype", b"application/epub+zip")
            .file(
                "META-INF/container.xml",
                br#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
            );

        if let Some(xml) = &self.encryption {
            zip = zip.file("META-INF/encryption.xml", xml.as_bytes());
        }

        zip = zip.file("OEBPS/content.opf", self.opf().as_bytes());

        for chapter in &self.chapters {
            let doc = self.chapter_document(chapter);
            zip = zip.file(&format!("OEBPS/{}", chapter.href), doc.as_bytes());
        }
        if self.with_nav {
            zip = zip.file("OEBPS/nav.xhtml", self.nav_document().as_bytes());
        }
        if self.with_ncx {
            zip = zip.file("OEBPS/toc.ncx", self.ncx_document().as_bytes());
        }
        if let Some((href, css)) = &self.stylesheet {
            zip = zip.file(&format!("OEBPS/{href}"), css.as_bytes());
        }
        for (href, _, data) in &self.resources {
            zip = zip.file(&format!("OEBPS/{href}"), data);
        }
        for (_, href, _, data) in &self.spine_resources {
            zip = zip.file(&format!("OEBPS/{href}"), data);
        }
        if let Some((_, href, _, data)) = &self.cover {
            zip = zip.file(&format!("OEBPS/{href}"), data);
        }
        for (name, data) in &self.raw_files {
            zip = zip.file(name, data);
        }
        zip.finish()
    }

    fn opf(&self) -> String {
        let mut manifest = String::new();
        let mut spine = String::new();
        for c in &self.chapters {
            manifest.push_str(&format!(
                "    <item id=\"{}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
                c.id, c.href
            ));
            spine.push_str(&format!("    <itemref idref=\"{}\"/>\n", c.id));
        }
        if self.with_nav {
            manifest.push_str(
                "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n",
            );
        }
        if self.with_ncx {
            manifest.push_str(
                "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n",
            );
        }
        if let Some((href, _)) = &self.stylesheet {
            manifest.push_str(&format!(
                "    <item id=\"css\" href=\"{href}\" media-type=\"text/css\"/>\n"
            ));
        }
        for (i, (href, media_type, _)) in self.resources.iter().enumerate() {
            manifest.push_str(&format!(
                "    <item id=\"res{i}\" href=\"{href}\" media-type=\"{media_type}\"/>\n"
            ));
        }
        for (id, href, media_type, _) in &self.spine_resources {
            manifest.push_str(&format!(
                "    <item id=\"{id}\" href=\"{href}\" media-type=\"{media_type}\"/>\n"
            ));
            spine.push_str(&format!("    <itemref idref=\"{id}\"/>\n"));
        }
        let mut cover_meta = String::new();
        if let Some((marker, href, media_type, _)) = &self.cover {
            let properties = match marker {
                CoverMarker::Property => " properties=\"cover-image\"",
                CoverMarker::Meta => {
                    cover_meta.push_str("    <meta name=\"cover\" content=\"cover-img\"/>\n");
                    ""
                }
            };
            manifest.push_str(&format!(
                "    <item id=\"cover-img\" href=\"{href}\" media-type=\"{media_type}\"{properties}/>\n"
            ));
        }

        let creators: String = self
            .authors
            .iter()
            .map(|a| format!("    <dc:creator>{a}</dc:creator>\n"))
            .collect();
        let toc_attr = if self.with_ncx { " toc=\"ncx\"" } else { "" };

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:uuid:test</dc:identifier>
    <dc:title>{title}</dc:title>
{creators}    <dc:language>{lang}</dc:language>
{cover_meta}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine{toc_attr}>
{spine}  </spine>
</package>"#,
            title = self.title,
            lang = self.language,
        )
    }

    fn chapter_document(&self, chapter: &Chapter) -> String {
        let link = match &self.stylesheet {
            Some((href, _)) => format!(
                "<link rel=\"stylesheet\" type=\"text/css\" href=\"{}\"/>",
                relative_href(&chapter.href, href)
            ),
            None => String::new(),
        };
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>{id}</title>{link}</head>
<body>{body}</body>
</html>"#,
            id = chapter.id,
            body = chapter.body,
        )
    }

    fn nav_entries(&self) -> Vec<(&str, &str)> {
        fn titled(c: &Chapter) -> Option<(&str, &str)> {
            Some((c.href.as_str(), c.nav_title.as_deref()?))
        }
        match &self.nav_order {
            Some(order) => order
                .iter()
                .filter_map(|id| self.chapters.iter().find(|c| &c.id == id))
                .filter_map(titled)
                .collect(),
            None => self.chapters.iter().filter_map(titled).collect(),
        }
    }

    fn nav_document(&self) -> String {
        let items: String = self
            .nav_entries()
            .into_iter()
            .map(|(href, title)| format!("      <li><a href=\"{href}\">{title}</a></li>\n"))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>Contents</title></head>
<body>
  <nav epub:type="toc">
    <ol>
{items}    </ol>
  </nav>
</body>
</html>"#
        )
    }

    fn ncx_document(&self) -> String {
        let points: String = self
            .nav_entries()
            .into_iter()
            .enumerate()
            .map(|(i, (href, title))| {
                format!(
                    "    <navPoint id=\"np{n}\" playOrder=\"{n}\"><navLabel><text>{title}</text></navLabel><content src=\"{href}\"/></navPoint>\n",
                    n = i + 1
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
{points}  </navMap>
</ncx>"#
        )
    }
}

/// Href from one package-relative document to another.
fn relative_href(from: &str, to: &str) -> String {
    let depth = from.matches('/').count();
    format!("{}{}", "../".repeat(depth), to)
}

/// Build a `.zip` HTML bundle with the given entries.
pub fn html_bundle(entries: &[(&str, &[u8])]) -> Vec<u8> {
    entries
        .iter()
        .fold(ZipBuilder::new(), |zip, (name, data)| zip.file(name, data))
        .finish()
}
