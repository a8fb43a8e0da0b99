//! Bounded plain-text and markup digest of a whole report.

use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::{compile, compile_all, truncate_chars};

lazy_static! {
    static ref MAIN_CONTENT_SELECTORS: Vec<(&'static str, Selector)> = compile_all(&[
        ".test-content",
        ".test-list",
        "#test-view",
        ".main-content",
        "main",
        ".container",
        ".content",
        "body",
    ]);
    static ref BODY: Selector = compile("body");

    static ref SCRIPT_RE: Regex = Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>")
        .expect("Failed to compile SCRIPT_RE regex");
    static ref STYLE_RE: Regex = Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>")
        .expect("Failed to compile STYLE_RE regex");
    static ref LINK_RE: Regex = Regex::new(r"(?is)<link\b[^>]*>")
        .expect("Failed to compile LINK_RE regex");
}

const MAX_CONTAINERS: usize = 10;
const MIN_CONTAINER_CHARS: usize = 50;
const MAX_TEXT_CHARS: usize = 20_000;
const MAX_HTML_CHARS: usize = 15_000;

/// Text with blank lines dropped and each line trimmed.
fn collapse_whitespace(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn container_text(el: ElementRef<'_>) -> Option<String> {
    let text = collapse_whitespace(&el.text().collect::<String>());
    (text.chars().count() > MIN_CONTAINER_CHARS).then_some(text)
}

fn main_content_text(document: &Html) -> String {
    for (css, selector) in MAIN_CONTENT_SELECTORS.iter() {
        let texts: Vec<String> = document
            .select(selector)
            .filter_map(container_text)
            .take(MAX_CONTAINERS)
            .collect();
        if !texts.is_empty() {
            debug!(selector = *css, containers = texts.len(), "main content selected");
            return truncate_chars(&texts.join("\n\n"), MAX_TEXT_CHARS);
        }
    }
    String::new()
}

fn stripped_body_html(document: &Html) -> String {
    let markup = document
        .select(&BODY)
        .next()
        .map(|body| body.inner_html())
        .unwrap_or_else(|| document.root_element().html());
    let markup = SCRIPT_RE.replace_all(&markup, "");
    let markup = STYLE_RE.replace_all(&markup, "");
    let markup = LINK_RE.replace_all(&markup, "");
    truncate_chars(markup.trim(), MAX_HTML_CHARS)
}

/// Digest handed to the analysis service next to the structured records.
pub fn summarize_raw_content(document: &Html) -> String {
    format!(
        "=== TEXT CONTENT ===\n{}\n\n=== HTML STRUCTURE (truncated) ===\n{}",
        main_content_text(document),
        stripped_body_html(document)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_strips_scripts_styles_and_links() {
        let html = r#"<html><head><link rel="stylesheet" href="x.css"></head><body>
            <style>.a { color: red }</style>
            <script>var secret = 1;</script>
            <link rel="preload" href="y.js">
            <div class="content">Suite summary text that is comfortably longer than fifty characters.</div>
        </body></html>"#;
        let digest = summarize_raw_content(&Html::parse_document(html));
        assert!(!digest.contains("var secret"));
        assert!(!digest.contains("color: red"));
        assert!(!digest.contains("y.js"));
        assert!(digest.contains("Suite summary text"));
    }

    #[test]
    fn short_containers_are_skipped_for_the_next_selector() {
        let html = r#"<body><div class="test-content">short</div>
            <main>Main area holding enough words to pass the fifty character threshold.</main></body>"#;
        let text = main_content_text(&Html::parse_document(html));
        assert!(text.starts_with("Main area"));
    }

    #[test]
    fn markup_is_truncated() {
        let html = format!("<body><p>{}</p></body>", "a".repeat(40_000));
        let digest = stripped_body_html(&Html::parse_document(&html));
        assert_eq!(digest.chars().count(), MAX_HTML_CHARS);
    }

    #[test]
    fn at_most_ten_containers_are_used() {
        let para = "Container text that is definitely longer than fifty characters in total.";
        let body: String = (0..15).map(|_| format!("<section class=\"content\">{}</section>", para)).collect();
        let html = format!("<body>{}</body>", body);
        let text = main_content_text(&Html::parse_document(&html));
        assert_eq!(text.matches("Container text").count(), 10);
    }
}
