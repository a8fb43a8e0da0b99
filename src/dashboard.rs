//! Plain-text rendering of parse and analysis results.

use std::fmt::Write as _;

use crate::analysis::{AnalysisResult, AnalysisSource, DefectCategory};
use crate::model::{RunSummary, TestCase};

const RULE: &str = "------------------------------------------------------------";
const MAX_MESSAGE_CHARS: usize = 120;

fn one_line(text: &str) -> String {
    let first = text.lines().next().unwrap_or("").trim();
    if first.chars().count() > MAX_MESSAGE_CHARS {
        let mut cut: String = first.chars().take(MAX_MESSAGE_CHARS).collect();
        cut.push_str("...");
        cut
    } else {
        first.to_string()
    }
}

/// Summary cards: counts, pass rate and total duration.
pub fn render_summary(title: &str, summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", title);
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(
        out,
        "  Total {:>5}   Passed {:>5}   Failed {:>5}   Skipped {:>5}",
        summary.total, summary.passed, summary.failed, summary.skipped
    );
    let _ = writeln!(
        out,
        "  Pass rate {:>6.1}%   Duration {:.2}s",
        summary.pass_rate, summary.total_duration
    );
    out
}

pub fn render_test_cases(tests: &[TestCase]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nTests");
    let _ = writeln!(out, "{}", RULE);
    for tc in tests {
        let _ = writeln!(
            out,
            "  {} {:<8} {}  ({:.2}s)",
            tc.status.icon(),
            tc.id,
            tc.name,
            tc.duration
        );
        if let Some(message) = &tc.error_message {
            let _ = writeln!(out, "             {}", one_line(message));
        }
        if !tc.screenshots.is_empty() {
            let _ = writeln!(out, "             {} screenshot(s)", tc.screenshots.len());
        }
    }
    out
}

/// Failures grouped by category in report order, then patterns, then
/// recommendations (already ordered high to low).
pub fn render_analysis(analysis: &AnalysisResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nAnalysis");
    let _ = writeln!(out, "{}", RULE);
    if analysis.source == AnalysisSource::Fallback {
        let _ = writeln!(out, "  (local heuristics; the analysis service gave no usable answer)");
    }
    let _ = writeln!(out, "  {}", analysis.summary);

    for category in DefectCategory::ALL {
        let failures: Vec<_> = analysis.failures_in(category).collect();
        if failures.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n  {} ({})", category.label(), failures.len());
        for f in failures {
            let _ = writeln!(
                out,
                "    {} {} [{} confidence]",
                f.test_id,
                f.test_name,
                f.confidence.as_str()
            );
            let _ = writeln!(out, "      cause: {}", one_line(&f.root_cause));
            let _ = writeln!(out, "      fix:   {}", one_line(&f.suggested_fix));
        }
    }

    if !analysis.patterns.is_empty() {
        let _ = writeln!(out, "\n  Patterns");
        for p in &analysis.patterns {
            let _ = writeln!(out, "    * {}: {}", p.name, p.description);
            if !p.affected_tests.is_empty() {
                let _ = writeln!(out, "      affects {}", p.affected_tests.join(", "));
            }
        }
    }

    if !analysis.recommendations.is_empty() {
        let _ = writeln!(out, "\n  Recommendations");
        for r in &analysis.recommendations {
            let _ = writeln!(out, "    [{}] {}", r.priority.as_str(), r.title);
            if !r.description.is_empty() {
                let _ = writeln!(out, "      {}", r.description);
            }
        }
    }

    if !analysis.additional_tests.is_empty() {
        let _ = writeln!(out, "\n  Additional tests found in the raw report");
        for tc in &analysis.additional_tests {
            let _ = writeln!(out, "    {} {} {}", tc.status.icon(), tc.id, tc.name);
        }
    }
    out
}
