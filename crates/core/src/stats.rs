//! Reading statistics and display-text helpers.

use scraper::node::Node;
use scraper::{Html, Selector};
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// Average adult reading speed used for time estimates.
pub const WORDS_PER_MINUTE: u64 = 200;

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "li", "td", "th", "tr", "br", "h1", "h2", "h3", "h4", "h5",
    "h6", "blockquote", "pre", "dt", "dd", "figcaption", "caption", "hr",
];

/// Visible text of a sanitized fragment, with block boundaries as spaces.
pub fn fragment_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut text = String::with_capacity(html.len() / 2);
    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Text(t) => text.push_str(t),
            Node::Element(e) if BLOCK_ELEMENTS.contains(&e.name()) => text.push(' '),
            _ => {}
        }
    }
    text
}

/// Unicode-aware word count.
pub fn count_words(text: &str) -> u64 {
    text.unicode_words().count() as u64
}

/// Estimated reading time in whole minutes, rounded up.
pub fn reading_minutes(words: u64) -> u64 {
    words.div_ceil(WORDS_PER_MINUTE)
}

/// Collapse whitespace and NFC-normalize a title. Empty input gives `None`.
pub fn clean_title(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.nfc().collect())
    }
}

/// Text of the first `h1`-`h6` in a fragment.
pub fn first_heading(html: &str) -> Option<String> {
    let selector = Selector::parse("h1, h2, h3, h4, h5, h6").ok()?;
    let fragment = Html::parse_fragment(html);
    let heading = fragment.select(&selector).next()?;
    clean_title(&heading.text().collect::<String>())
}
