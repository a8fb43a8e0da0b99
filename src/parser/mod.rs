//! Heuristic parser for Extent-style HTML test reports.
//!
//! Extraction degrades through three tiers:
//!   Tier 1: a known test-node selector matches (structured)
//!   Tier 2: any element with a status-like class token (heuristic)
//!   Tier 3: aggregate pass/fail/skip counts in the page text (regex fallback)
//!
//! The raw digest is produced independently of the tier so the analysis
//! service always sees the page content, even when tier 1 succeeded.

mod digest;
mod fallback;
mod fields;
mod status;

pub use digest::summarize_raw_content;
pub use fallback::{extract_from_counts, FALLBACK_ERROR_MESSAGE};
pub use fields::{extract_test_case, parse_duration};
pub use status::classify_status;

use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

use crate::model::{ExtractionTier, ParsedReport, TestCase};

lazy_static! {
    // Order is priority: generic report classes, then table rows, then
    // node/category trees. The first selector with any match wins.
    static ref TEST_NODE_SELECTORS: Vec<(&'static str, Selector)> = compile_all(&[
        ".test-item",
        ".test-case",
        ".testcase",
        ".test-entry",
        ".test",
        "[data-test-id]",
        "table.test-table tbody tr",
        "tr.test-row",
        "tr.test-result",
        ".node.leaf",
        ".test-node",
        ".node",
        ".category-item",
    ]);

    static ref ANY_ELEMENT: Selector = compile("*");
}

const STATUS_CLASS_TOKENS: &[&str] = &["pass", "fail", "skip", "error"];

pub(crate) fn compile(css: &str) -> Selector {
    Selector::parse(css).expect("built-in selector must parse")
}

pub(crate) fn compile_all(list: &[&'static str]) -> Vec<(&'static str, Selector)> {
    list.iter().map(|css| (*css, compile(css))).collect()
}

/// Trimmed text content of an element, `None` when blank.
pub(crate) fn element_text(el: ElementRef<'_>) -> Option<String> {
    let text = el.text().collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Candidate test nodes and the tier that found them.
pub struct NodeSelection<'a> {
    pub nodes: Vec<ElementRef<'a>>,
    pub tier: ExtractionTier,
}

/// Run the node selector cascade.
///
/// An empty `nodes` means the document carries no structural signal at all
/// and the caller must fall back to count extraction.
pub fn find_test_nodes(document: &Html) -> NodeSelection<'_> {
    for (css, selector) in TEST_NODE_SELECTORS.iter() {
        let nodes: Vec<ElementRef<'_>> = document.select(selector).collect();
        if !nodes.is_empty() {
            debug!(selector = *css, count = nodes.len(), "test node selector matched");
            return NodeSelection {
                nodes,
                tier: ExtractionTier::Structured,
            };
        }
    }

    let nodes: Vec<ElementRef<'_>> = document
        .select(&ANY_ELEMENT)
        .filter(|el| has_status_class(*el))
        .collect();

    if nodes.is_empty() {
        debug!("no test nodes found in document");
        NodeSelection {
            nodes,
            tier: ExtractionTier::RegexFallback,
        }
    } else {
        debug!(count = nodes.len(), "status class fallback matched");
        NodeSelection {
            nodes,
            tier: ExtractionTier::Heuristic,
        }
    }
}

fn has_status_class(el: ElementRef<'_>) -> bool {
    el.value()
        .attr("class")
        .map(|class| {
            let class = class.to_lowercase();
            STATUS_CLASS_TOKENS.iter().any(|token| class.contains(token))
        })
        .unwrap_or(false)
}

/// Whole-document text, one text node per line, used by the count fallback.
pub(crate) fn document_text(document: &Html) -> String {
    document.root_element().text().collect::<Vec<_>>().join("\n")
}

/// Parse an HTML report into test-case records plus a raw digest.
///
/// Never fails: every miss is recovered with a placeholder, and a document
/// without any recognizable structure still yields one record.
pub fn parse_report(html: &str) -> ParsedReport {
    let document = Html::parse_document(html);
    let selection = find_test_nodes(&document);

    let test_cases: Vec<TestCase> = if selection.nodes.is_empty() {
        extract_from_counts(&document_text(&document))
    } else {
        selection
            .nodes
            .iter()
            .enumerate()
            .map(|(position, node)| extract_test_case(*node, position))
            .collect()
    };

    let raw_content = summarize_raw_content(&document);
    let report = ParsedReport::new(test_cases, raw_content, selection.tier);

    info!(
        tier = ?report.tier,
        total = report.summary.total,
        failed = report.summary.failed,
        digest_chars = report.raw_content.len(),
        "parsed report"
    );
    report
}
