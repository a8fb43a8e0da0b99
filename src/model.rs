use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Pass,
    Fail,
    Skip,
}

impl TestStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            TestStatus::Pass => "✔",
            TestStatus::Fail => "✘",
            TestStatus::Skip => "⊘",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Skip => "skip",
        }
    }
}

/// An inline image recovered from a `data:` URI. The payload is kept
/// exactly as it appeared in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub name: String,
    pub mime_type: String,
    pub base64_data: String,
}

/// One observed test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub name: String,
    pub class_name: String,
    pub status: TestStatus,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps_to_reproduce: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<Screenshot>,
    pub timestamp: DateTime<Utc>,
}

pub const UNKNOWN_CLASS: &str = "Unknown Class";

/// Ids are positional: the n-th extracted record is always `test-n`.
pub fn test_id(position: usize) -> String {
    format!("test-{}", position + 1)
}

pub fn placeholder_name(position: usize) -> String {
    format!("Test Case {}", position + 1)
}

impl TestCase {
    /// A record with every optional field empty.
    pub fn placeholder(position: usize, status: TestStatus) -> Self {
        Self {
            id: test_id(position),
            name: placeholder_name(position),
            class_name: UNKNOWN_CLASS.to_string(),
            status,
            duration: 0.0,
            error_message: None,
            stack_trace: None,
            logs: Vec::new(),
            steps_to_reproduce: Vec::new(),
            screenshots: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == TestStatus::Fail
    }
}

/// Which extraction tier produced the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    /// A known test-node selector matched.
    Structured,
    /// Only elements carrying status-like class tokens were found.
    Heuristic,
    /// No nodes at all; records were synthesized from aggregate counts.
    RegexFallback,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pass_rate: f64,
    pub total_duration: f64,
}

impl RunSummary {
    pub fn from_tests(tests: &[TestCase]) -> Self {
        let mut summary = RunSummary {
            total: tests.len(),
            ..Default::default()
        };
        for test in tests {
            match test.status {
                TestStatus::Pass => summary.passed += 1,
                TestStatus::Fail => summary.failed += 1,
                TestStatus::Skip => summary.skipped += 1,
            }
            summary.total_duration += test.duration;
        }
        if summary.total > 0 {
            summary.pass_rate = summary.passed as f64 * 100.0 / summary.total as f64;
        }
        summary
    }
}

/// Output of one parse: the structured records plus the raw digest handed
/// to the analysis service alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedReport {
    pub test_cases: Vec<TestCase>,
    pub raw_content: String,
    pub tier: ExtractionTier,
    pub summary: RunSummary,
}

impl ParsedReport {
    pub fn new(test_cases: Vec<TestCase>, raw_content: String, tier: ExtractionTier) -> Self {
        let summary = RunSummary::from_tests(&test_cases);
        Self {
            test_cases,
            raw_content,
            tier,
            summary,
        }
    }

    pub fn failed_tests(&self) -> impl Iterator<Item = &TestCase> {
        self.test_cases.iter().filter(|t| t.is_failed())
    }

    pub fn find(&self, id: &str) -> Option<&TestCase> {
        self.test_cases.iter().find(|t| t.id == id)
    }
}
