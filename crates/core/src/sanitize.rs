//! Allowlist HTML sanitizer for chapter bodies and the aggregate document.
//!
//! Markup is parsed with the HTML5 tree builder, then re-serialized keeping
//! only allowlisted elements and attributes. Output is re-parsed until it is a
//! fixed point of parse-then-render, which makes `sanitize` idempotent.

use scraper::node::Node;
use scraper::{ElementRef, Html};

use crate::error::SanitizeError;
use crate::limits::IngestLimits;

/// Upper bound on re-parse passes. Parser fix-ups settle after one or two.
const MAX_PASSES: usize = 4;

/// Elements kept with their attributes filtered.
const ALLOWED_ELEMENTS: &[&str] = &[
    "a", "abbr", "address", "article", "aside", "b", "bdi", "bdo", "blockquote", "br", "caption",
    "cite", "code", "col", "colgroup", "dd", "del", "details", "dfn", "div", "dl", "dt", "em",
    "figcaption", "figure", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "i",
    "img", "ins", "kbd", "li", "mark", "nav", "ol", "p", "pre", "q", "rp", "rt", "ruby", "s",
    "samp", "section", "small", "span", "strong", "sub", "summary", "sup", "table", "tbody", "td",
    "tfoot", "th", "thead", "time", "tr", "u", "ul", "var", "wbr",
];

/// Elements removed together with everything inside them.
const DROPPED_ELEMENTS: &[&str] = &[
    "script", "style", "iframe", "frame", "frameset", "object", "embed", "applet", "noscript",
    "noembed", "noframes", "template", "svg", "math", "form", "input", "button", "select",
    "textarea", "option", "optgroup", "datalist", "xmp", "plaintext", "title", "head", "meta",
    "link", "base", "audio", "video", "source", "track", "canvas", "param", "portal", "dialog",
];

const VOID_ELEMENTS: &[&str] = &["br", "col", "hr", "img", "wbr"];

const GLOBAL_ATTRIBUTES: &[&str] = &["id", "class", "title", "lang", "dir", "style"];

/// URL-valued attributes, routed through the [`UrlPolicy`].
const URL_ATTRIBUTES: &[&str] = &["href", "src", "cite"];

fn element_attributes(element: &str) -> &'static [&'static str] {
    match element {
        "a" => &["href"],
        "img" => &["src", "alt", "width", "height"],
        "td" | "th" => &["colspan", "rowspan", "headers", "scope"],
        "ol" => &["start", "type", "reversed"],
        "li" => &["value"],
        "col" | "colgroup" => &["span"],
        "time" => &["datetime"],
        "q" | "blockquote" | "del" | "ins" => &["cite"],
        _ => &[],
    }
}

/// Decides what happens to a URL-valued attribute that survived scheme filtering.
pub trait UrlPolicy {
    /// Return the value to emit, or `None` to drop the attribute.
    fn rewrite(&mut self, element: &str, attribute: &str, value: &str) -> Option<String>;
}

/// Policy that keeps every URL as written.
pub struct KeepUrls;

impl UrlPolicy for KeepUrls {
    fn rewrite(&mut self, _element: &str, _attribute: &str, value: &str) -> Option<String> {
        Some(value.to_string())
    }
}

/// Result of one sanitization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub html: String,
    /// The output cap cut content off.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    max_input_bytes: usize,
    max_output_bytes: usize,
    max_depth: u32,
}

impl Sanitizer {
    pub fn new(max_input_bytes: u64, max_output_bytes: u64, max_depth: u32) -> Self {
        let max_input_bytes = usize::try_from(max_input_bytes).unwrap_or(usize::MAX);
        let max_output_bytes = usize::try_from(max_output_bytes)
            .unwrap_or(usize::MAX)
            .min(max_input_bytes);
        Self {
            max_input_bytes,
            max_output_bytes,
            max_depth,
        }
    }

    /// Sanitizer for individual chapters.
    pub fn for_chapters(limits: &IngestLimits) -> Self {
        Self::new(
            limits.max_input_bytes,
            limits.max_unit_bytes,
            limits.max_nesting_depth,
        )
    }

    /// Sanitizer for the aggregate book document.
    pub fn for_document(limits: &IngestLimits) -> Self {
        Self::new(
            limits.max_document_bytes,
            limits.max_document_bytes,
            limits.max_nesting_depth.saturating_add(2),
        )
    }

    /// Sanitize markup, keeping URLs that pass scheme filtering unchanged.
    pub fn sanitize(&self, input: &str) -> Result<String, SanitizeError> {
        Ok(self.sanitize_with(input, &mut KeepUrls)?.html)
    }

    /// Sanitize markup, passing URL attributes through `policy` on the first pass.
    pub fn sanitize_with(
        &self,
        input: &str,
        policy: &mut dyn UrlPolicy,
    ) -> Result<Sanitized, SanitizeError> {
        if input.len() > self.max_input_bytes {
            return Err(SanitizeError::InputTooLarge {
                size: input.len() as u64,
                limit: self.max_input_bytes as u64,
            });
        }

        let mut result = self.render(input, policy)?;
        for _ in 0..MAX_PASSES {
            let next = self.render(&result.html, &mut KeepUrls)?;
            if next.html == result.html {
                break;
            }
            result.truncated |= next.truncated;
            result.html = next.html;
        }
        Ok(result)
    }

    fn render(&self, input: &str, policy: &mut dyn UrlPolicy) -> Result<Sanitized, SanitizeError> {
        let fragment = Html::parse_fragment(input);
        let mut renderer = Renderer {
            policy,
            out: String::with_capacity(input.len().min(self.max_output_bytes)),
            cap: self.max_output_bytes,
            reserved: 0,
            truncated: false,
            max_depth: self.max_depth,
            after_pre_open: false,
        };
        renderer.children(fragment.root_element(), 0)?;
        Ok(Sanitized {
            html: renderer.out,
            truncated: renderer.truncated,
        })
    }
}

struct Renderer<'p> {
    policy: &'p mut dyn UrlPolicy,
    out: String,
    cap: usize,
    /// Bytes needed to close every element currently open.
    reserved: usize,
    truncated: bool,
    max_depth: u32,
    /// Nothing has been written since the last `<pre>` open tag.
    after_pre_open: bool,
}

impl Renderer<'_> {
    fn children(&mut self, parent: ElementRef<'_>, depth: u32) -> Result<(), SanitizeError> {
        for child in parent.children() {
            if self.truncated {
                break;
            }
            match child.value() {
                Node::Text(text) => self.text(text),
                Node::Element(_) => {
                    if let Some(element) = ElementRef::wrap(child) {
                        self.element(element, depth + 1)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn element(&mut self, element: ElementRef<'_>, depth: u32) -> Result<(), SanitizeError> {
        if depth > self.max_depth {
            return Err(SanitizeError::ExcessiveNesting {
                depth,
                limit: self.max_depth,
            });
        }

        let name = element.value().name();
        if DROPPED_ELEMENTS.contains(&name) {
            return Ok(());
        }
        if !ALLOWED_ELEMENTS.contains(&name) {
            return self.children(element, depth);
        }

        let open = self.open_tag(element, name);
        let is_void = VOID_ELEMENTS.contains(&name);
        let close_len = if is_void { 0 } else { name.len() + 3 };
        if self.out.len() + open.len() + close_len + self.reserved > self.cap {
            self.truncated = true;
            return Ok(());
        }

        self.out.push_str(&open);
        self.after_pre_open = name == "pre";
        if is_void {
            return Ok(());
        }

        self.reserved += close_len;
        self.children(element, depth)?;
        self.reserved -= close_len;

        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push('>');
        self.after_pre_open = false;
        Ok(())
    }

    fn open_tag(&mut self, element: ElementRef<'_>, name: &str) -> String {
        let allowed = element_attributes(name);
        let mut attrs: Vec<(&str, String)> = Vec::new();
        for (attr, value) in element.value().attrs() {
            if !(GLOBAL_ATTRIBUTES.contains(&attr) || allowed.contains(&attr)) {
                continue;
            }
            if attrs.iter().any(|(a, _)| *a == attr) {
                continue;
            }
            let kept = if URL_ATTRIBUTES.contains(&attr) {
                if has_dangerous_scheme(value) {
                    None
                } else {
                    self.policy.rewrite(name, attr, value)
                }
            } else if attr == "style" {
                is_safe_inline_style(value).then(|| value.to_string())
            } else {
                Some(value.to_string())
            };
            if let Some(kept) = kept {
                attrs.push((attr, kept));
            }
        }
        attrs.sort_by(|a, b| a.0.cmp(b.0));

        let mut tag = String::with_capacity(name.len() + 2);
        tag.push('<');
        tag.push_str(name);
        for (attr, value) in attrs {
            tag.push(' ');
            tag.push_str(attr);
            tag.push_str("=\"");
            escape_into(&mut tag, &value, true);
            tag.push('"');
        }
        tag.push('>');
        tag
    }

    fn text(&mut self, text: &str) {
        // The parser eats one newline right after `<pre>`.
        let prefix = if self.after_pre_open && text.starts_with('\n') {
            "\n"
        } else {
            ""
        };
        let available = self.cap.saturating_sub(self.out.len() + self.reserved);
        let mut escaped = String::with_capacity(text.len().min(available));
        let mut piece = String::new();
        for c in text.chars() {
            piece.clear();
            escape_into(&mut piece, c.encode_utf8(&mut [0u8; 4]), false);
            if prefix.len() + escaped.len() + piece.len() > available {
                self.truncated = true;
                break;
            }
            escaped.push_str(&piece);
        }
        if !escaped.is_empty() {
            self.out.push_str(prefix);
            self.out.push_str(&escaped);
            self.after_pre_open = false;
        }
    }
}

/// Escape a value the way attribute values are written out.
pub(crate) fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    escape_into(&mut out, value, true);
    out
}

fn escape_into(out: &mut String, value: &str, attribute: bool) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\r' => out.push_str("&#13;"),
            '\0' => {}
            c => out.push(c),
        }
    }
}

/// `javascript:`, `vbscript:`, and `data:` URLs, however obfuscated with
/// whitespace, control characters, or case.
pub fn has_dangerous_scheme(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase();
    ["javascript:", "vbscript:", "data:"]
        .iter()
        .any(|scheme| compact.starts_with(scheme))
}

fn is_safe_inline_style(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    !(lower.contains("url(") || lower.contains('\\') || lower.contains("/*"))
        && sanitize_stylesheet(value) == value
}

/// Tokens that load code or remote content from CSS.
const CSS_BLOCKLIST: &[&str] = &[
    "expression(",
    "javascript:",
    "vbscript:",
    "behavior:",
    "behaviour:",
    "-moz-binding",
];

/// Neutralize a stylesheet: strips comments, escapes, `@import` rules, script
/// hooks, and `url()` arguments that carry a scheme. Repeats until stable.
pub fn sanitize_stylesheet(css: &str) -> String {
    let mut current = css.replace('\0', "");
    loop {
        let next = css_pass(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn css_pass(css: &str) -> String {
    let mut out = strip_css_comments(css).replace('\\', "");

    while let Some(start) = find_ascii_ci(&out, "@import") {
        let end = out[start..]
            .find([';', '\n'])
            .map_or(out.len(), |i| start + i + 1);
        out.replace_range(start..end, "");
    }

    for token in CSS_BLOCKLIST {
        while let Some(start) = find_ascii_ci(&out, token) {
            out.replace_range(start..start + token.len(), "");
        }
    }

    neutralize_css_urls(&out)
}

fn strip_css_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Replace `url(scheme:...)` with `url()`; relative URLs resolve inside the book.
fn neutralize_css_urls(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = find_ascii_ci(rest, "url(") {
        let arg_start = start + 4;
        out.push_str(&rest[..arg_start]);
        let arg_end = rest[arg_start..]
            .find(')')
            .map_or(rest.len(), |i| arg_start + i);
        let arg = rest[arg_start..arg_end].trim().trim_matches(['"', '\'']);
        if !(crate::paths::has_scheme(arg) || arg.starts_with("//")) {
            out.push_str(&rest[arg_start..arg_end]);
        }
        rest = &rest[arg_end..];
    }
    out.push_str(rest);
    out
}

fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}
