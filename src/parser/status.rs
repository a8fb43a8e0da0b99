//! Pass/fail/skip inference for a single test node.
//!
//! Classification is a pipeline of stages. Each stage looks at its own
//! evidence and, when it finds any, overwrites the verdict of the stages
//! before it. The badge stage runs last so a dedicated status widget beats
//! keywords found anywhere in the node.

use lazy_static::lazy_static;
use scraper::{ElementRef, Selector};
use tracing::trace;

use super::compile;
use crate::model::TestStatus;

lazy_static! {
    static ref BADGE: Selector =
        compile(".status, .badge, .test-status, .status-badge, .label");
}

const FAIL_KEYWORDS: &[&str] = &["fail", "error", "failed", "exception"];
const SKIP_KEYWORDS: &[&str] = &["skip", "skipped"];
const PASS_KEYWORDS: &[&str] = &["pass", "success", "✓", "✔"];

type Stage = fn(ElementRef<'_>) -> Option<TestStatus>;

const STAGES: &[(&str, Stage)] = &[("node", node_evidence), ("badge", badge_evidence)];

/// Keyword verdict for lowercased evidence text: fail beats skip beats pass.
pub(crate) fn keyword_verdict(evidence: &str) -> Option<TestStatus> {
    let has_any = |keywords: &[&str]| keywords.iter().any(|k| evidence.contains(k));
    if has_any(FAIL_KEYWORDS) {
        Some(TestStatus::Fail)
    } else if has_any(SKIP_KEYWORDS) {
        Some(TestStatus::Skip)
    } else if has_any(PASS_KEYWORDS) {
        Some(TestStatus::Pass)
    } else {
        None
    }
}

fn node_evidence(node: ElementRef<'_>) -> Option<TestStatus> {
    let class = node.value().attr("class").unwrap_or("");
    let evidence = format!(
        "{} {} {}",
        class,
        node.inner_html(),
        node.text().collect::<String>()
    )
    .to_lowercase();
    keyword_verdict(&evidence)
}

fn badge_evidence(node: ElementRef<'_>) -> Option<TestStatus> {
    let badge = node.select(&BADGE).next()?;
    let class = badge.value().attr("class").unwrap_or("");
    let evidence = format!("{} {}", class, badge.text().collect::<String>()).to_lowercase();
    keyword_verdict(&evidence)
}

/// Infer the status of a test node. Defaults to pass.
pub fn classify_status(node: ElementRef<'_>) -> TestStatus {
    let mut status = TestStatus::default();
    for (stage, evaluate) in STAGES {
        if let Some(verdict) = evaluate(node) {
            trace!(stage, ?verdict, "status stage produced a verdict");
            status = verdict;
        }
    }
    status
}
