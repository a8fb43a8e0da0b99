//! Per-field extraction for one test node.
//!
//! Scalar fields (name, class name, duration) are read through an ordered
//! rule list: the first rule whose first matching element has non-empty text
//! wins. Evidence, steps and screenshots scan every match instead.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Selector};
use tracing::debug;

use super::status::classify_status;
use super::{compile, element_text, truncate_chars};
use crate::model::{placeholder_name, test_id, Screenshot, TestCase, TestStatus, UNKNOWN_CLASS};

const NAME_FALLBACK_MAX_CHARS: usize = 100;

/// One candidate source for a scalar field.
struct Rule {
    selector: Selector,
    read: fn(ElementRef<'_>) -> Option<String>,
}

impl Rule {
    fn text(css: &str) -> Self {
        Self {
            selector: compile(css),
            read: element_text,
        }
    }
}

fn first_match(node: ElementRef<'_>, rules: &[Rule]) -> Option<String> {
    rules
        .iter()
        .find_map(|rule| node.select(&rule.selector).next().and_then(rule.read))
}

lazy_static! {
    static ref NAME_RULES: Vec<Rule> = vec![
        Rule::text(".test-name"),
        Rule::text(".name"),
        Rule::text("td:first-child"),
        Rule::text("h1, h2, h3, h4, h5, h6"),
        Rule::text(".card-title"),
        Rule::text(".test-title"),
        Rule::text("a"),
    ];

    static ref CLASS_NAME_RULES: Vec<Rule> = vec![
        Rule::text(".class-name"),
        Rule::text(".category"),
        Rule::text(".test-class"),
        Rule::text(".package"),
    ];

    static ref DURATION_RULES: Vec<Rule> = vec![
        Rule::text(".duration"),
        Rule::text(".test-duration"),
        Rule::text(".elapsed"),
        Rule::text(".time"),
        Rule::text("[class*='duration']"),
    ];

    static ref EVIDENCE: Selector = compile(
        ".exception, .error, .stacktrace, .stack-trace, pre, code, .log, .step-details"
    );
    static ref STEPS: Selector =
        compile(".step, .test-step, .step-name, .step-details, li.step, .steps li");
    static ref LOG_LIKE: Selector =
        compile(".log-entry, .event-row td:last-child, .log, .details");
    static ref IMAGES: Selector = compile("img[src]");
    static ref LINKS: Selector = compile("a[href]");

    // Media type, optional `key=value` parameters, then the base64 payload.
    static ref DATA_URI_RE: Regex = Regex::new(r"(?s)^data:([^;,]+)(?:;[^;,=]+=[^;,]*)*;base64,(.+)$")
        .expect("Failed to compile DATA_URI_RE regex");
    static ref IMAGE_HREF_RE: Regex = Regex::new(r"(?i)\.(png|jpe?g|gif|bmp|webp)(\?.*)?$")
        .expect("Failed to compile IMAGE_HREF_RE regex");
}

/// Step text length band (exclusive bounds, in characters).
const STEP_MIN_CHARS: usize = 5;
const STEP_MAX_CHARS: usize = 500;
const LOG_STEP_MAX_CHARS: usize = 300;

/// Parse a duration label into seconds.
///
/// Everything except digits and dots is stripped first, so "12.5s" reads as
/// 12.5. Anything that still does not parse reads as 0.
pub fn parse_duration(text: &str) -> f64 {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0)
}

fn extract_name(node: ElementRef<'_>, position: usize) -> String {
    first_match(node, &NAME_RULES)
        .or_else(|| {
            let full = node.text().collect::<String>();
            full.lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(|line| truncate_chars(line, NAME_FALLBACK_MAX_CHARS))
        })
        .unwrap_or_else(|| placeholder_name(position))
}

fn looks_like_stack_trace(text: &str) -> bool {
    text.contains("Exception") || text.contains("Error") || text.contains("at ")
}

fn looks_like_error_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("assert") || lower.contains("expected") || text.contains("Error:")
}

#[derive(Default)]
struct Evidence {
    logs: Vec<String>,
    error_message: Option<String>,
    stack_trace: Option<String>,
}

fn collect_evidence(node: ElementRef<'_>, failed: bool) -> Evidence {
    let mut evidence = Evidence::default();
    for el in node.select(&EVIDENCE) {
        let Some(text) = element_text(el) else {
            continue;
        };
        // Nested matches (pre > code) repeat the same text.
        if evidence.logs.contains(&text) {
            continue;
        }
        if failed {
            if evidence.stack_trace.is_none() && looks_like_stack_trace(&text) {
                evidence.stack_trace = Some(text.clone());
            }
            if evidence.error_message.is_none() && looks_like_error_message(&text) {
                let first_line = text.lines().next().unwrap_or("").trim().to_string();
                evidence.error_message = Some(first_line);
            }
        }
        evidence.logs.push(text);
    }
    evidence
}

fn within_band(text: &str, max: usize) -> bool {
    let len = text.chars().count();
    len > STEP_MIN_CHARS && len < max
}

fn extract_steps(node: ElementRef<'_>) -> Vec<String> {
    let steps: Vec<String> = node
        .select(&STEPS)
        .filter_map(element_text)
        .filter(|text| within_band(text, STEP_MAX_CHARS))
        .collect();
    if !steps.is_empty() {
        return steps;
    }

    node.select(&LOG_LIKE)
        .filter_map(element_text)
        .filter(|text| within_band(text, LOG_STEP_MAX_CHARS) && !text.contains("Exception"))
        .collect()
}

/// Inline screenshots, plus textual references for images that would need
/// a fetch. References are appended to `logs`.
fn extract_screenshots(node: ElementRef<'_>, logs: &mut Vec<String>) -> Vec<Screenshot> {
    let mut screenshots = Vec::new();

    for img in node.select(&IMAGES) {
        let src = img.value().attr("src").unwrap_or("").trim();
        if let Some(caps) = DATA_URI_RE.captures(src) {
            let name = img
                .value()
                .attr("alt")
                .or_else(|| img.value().attr("title"))
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("screenshot-{}", screenshots.len() + 1));
            screenshots.push(Screenshot {
                name,
                mime_type: caps[1].to_string(),
                base64_data: caps[2].to_string(),
            });
        } else if src.starts_with("data:") {
            let header = src.split(',').next().unwrap_or(src);
            debug!(header, "inline image is not base64 encoded");
            logs.push(format!("Inline image not decoded: {}", truncate_chars(header, 80)));
        } else if !src.is_empty() {
            logs.push(format!("Screenshot reference: {}", src));
        }
    }

    for link in node.select(&LINKS) {
        let href = link.value().attr("href").unwrap_or("").trim();
        if IMAGE_HREF_RE.is_match(href) {
            logs.push(format!("Screenshot reference: {}", href));
        }
    }

    screenshots
}

/// Build one record from a test node found by the selector cascade.
pub fn extract_test_case(node: ElementRef<'_>, position: usize) -> TestCase {
    let status = classify_status(node);
    let failed = status == TestStatus::Fail;

    let name = extract_name(node, position);
    let class_name =
        first_match(node, &CLASS_NAME_RULES).unwrap_or_else(|| UNKNOWN_CLASS.to_string());
    let duration = first_match(node, &DURATION_RULES)
        .map(|text| parse_duration(&text))
        .unwrap_or(0.0);

    let Evidence {
        mut logs,
        error_message,
        stack_trace,
    } = collect_evidence(node, failed);
    let steps_to_reproduce = extract_steps(node);
    let screenshots = extract_screenshots(node, &mut logs);

    debug!(
        position,
        name = %name,
        status = status.as_str(),
        logs = logs.len(),
        screenshots = screenshots.len(),
        "extracted test case"
    );

    TestCase {
        id: test_id(position),
        name,
        class_name,
        status,
        duration,
        error_message,
        stack_trace,
        logs,
        steps_to_reproduce,
        screenshots,
        timestamp: Utc::now(),
    }
}
