//! Last-tier extraction from aggregate counts in the page text.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info};

use super::truncate_chars;
use crate::model::{TestCase, TestStatus};

lazy_static! {
    static ref PASS_COUNT_RE: Regex = Regex::new(r"(?i)\bpass(?:ed)?\s*[:=]?\s*(\d+)")
        .expect("Failed to compile PASS_COUNT_RE regex");
    static ref FAIL_COUNT_RE: Regex = Regex::new(r"(?i)\bfail(?:ed|ures?)?\s*[:=]?\s*(\d+)")
        .expect("Failed to compile FAIL_COUNT_RE regex");
    static ref SKIP_COUNT_RE: Regex = Regex::new(r"(?i)\bskip(?:ped)?\s*[:=]?\s*(\d+)")
        .expect("Failed to compile SKIP_COUNT_RE regex");
    static ref TEST_NAME_RE: Regex = Regex::new(r"(?i)\btest[\s_-]*name\s*[:=]\s*")
        .expect("Failed to compile TEST_NAME_RE regex");
    // A name ends at the next label or count sharing its line.
    static ref NAME_END_RE: Regex = Regex::new(
        r"(?i)\s+(?:test[\s_-]*name\s*[:=]|(?:pass(?:ed)?|fail(?:ed|ures?)?|skip(?:ped)?)\s*[:=]?\s*\d)"
    )
    .expect("Failed to compile NAME_END_RE regex");
}

pub const FALLBACK_ERROR_MESSAGE: &str = "Test failed - details not available in report structure";

const MAX_NAME_CHARS: usize = 100;

/// Upper bound on synthesized records.
const MAX_SYNTHETIC_RECORDS: usize = 10_000;

fn first_count(re: &Regex, text: &str) -> usize {
    re.captures(text)
        .and_then(|caps| caps[1].parse::<usize>().ok())
        .unwrap_or(0)
}

fn name_tokens(text: &str) -> Vec<String> {
    TEST_NAME_RE
        .find_iter(text)
        .map(|label| {
            let rest = &text[label.end()..];
            let line = rest.split(['\r', '\n']).next().unwrap_or_default();
            let name = match NAME_END_RE.find(line) {
                Some(end) => &line[..end.start()],
                None => line,
            };
            truncate_chars(name.trim(), MAX_NAME_CHARS)
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Build placeholder records from "Passed: N"-style counts.
///
/// Failed records come first, then skipped, then passed. With no counts at
/// all a single passing placeholder is returned, so the result is never empty.
pub fn extract_from_counts(text: &str) -> Vec<TestCase> {
    let failed = first_count(&FAIL_COUNT_RE, text);
    let skipped = first_count(&SKIP_COUNT_RE, text);
    let passed = first_count(&PASS_COUNT_RE, text);
    let names = name_tokens(text);

    debug!(failed, skipped, passed, names = names.len(), "count fallback matched");

    let total = failed
        .saturating_add(skipped)
        .saturating_add(passed)
        .min(MAX_SYNTHETIC_RECORDS);
    if total == 0 {
        info!("no test structure or counts found, emitting placeholder record");
        let mut placeholder = TestCase::placeholder(0, TestStatus::Pass);
        if let Some(name) = names.into_iter().next() {
            placeholder.name = name;
        }
        return vec![placeholder];
    }

    info!(total, "synthesizing test cases from aggregate counts");
    (0..total)
        .map(|position| {
            let status = if position < failed {
                TestStatus::Fail
            } else if position < failed.saturating_add(skipped) {
                TestStatus::Skip
            } else {
                TestStatus::Pass
            };
            let mut tc = TestCase::placeholder(position, status);
            if let Some(name) = names.get(position) {
                tc.name = name.clone();
            }
            if status == TestStatus::Fail {
                tc.error_message = Some(FALLBACK_ERROR_MESSAGE.to_string());
            }
            tc
        })
        .collect()
}
