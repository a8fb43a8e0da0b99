use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, TriageError};
use crate::model::{ParsedReport, TestCase, TestStatus, UNKNOWN_CLASS};
use crate::settings::{SettingsStore, OPENAI_API_KEY, OPENAI_ENDPOINT, OPENAI_MODEL};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const SERVICE: &str = "OpenAI";

const PROMPT_MAX_STACK_CHARS: usize = 2_000;
const PROMPT_MAX_LOGS: usize = 5;
const PROMPT_MAX_LOG_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectCategory {
    ApplicationDefect,
    AutomationScriptDefect,
    TestDataIssue,
    EnvironmentIssue,
    ConfigurationIssue,
    FlakyTest,
}

impl DefectCategory {
    pub const ALL: [DefectCategory; 6] = [
        DefectCategory::ApplicationDefect,
        DefectCategory::AutomationScriptDefect,
        DefectCategory::TestDataIssue,
        DefectCategory::EnvironmentIssue,
        DefectCategory::ConfigurationIssue,
        DefectCategory::FlakyTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DefectCategory::ApplicationDefect => "application_defect",
            DefectCategory::AutomationScriptDefect => "automation_script_defect",
            DefectCategory::TestDataIssue => "test_data_issue",
            DefectCategory::EnvironmentIssue => "environment_issue",
            DefectCategory::ConfigurationIssue => "configuration_issue",
            DefectCategory::FlakyTest => "flaky_test",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DefectCategory::ApplicationDefect => "Application Defect",
            DefectCategory::AutomationScriptDefect => "Automation Script Defect",
            DefectCategory::TestDataIssue => "Test Data Issue",
            DefectCategory::EnvironmentIssue => "Environment Issue",
            DefectCategory::ConfigurationIssue => "Configuration Issue",
            DefectCategory::FlakyTest => "Flaky Test",
        }
    }

    /// Lenient parse: "Application Defect", "application-defect" and
    /// "APPLICATION_DEFECT" all map to the same category.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        Self::ALL.into_iter().find(|c| c.as_str() == normalized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }

    /// Accepts "high"/"medium"/"low" or a 0..1 (or 0..100) score.
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "high" => Confidence::High,
                "low" => Confidence::Low,
                _ => Confidence::Medium,
            },
            Some(Value::Number(n)) => {
                let mut score = n.as_f64().unwrap_or(0.5);
                if score > 1.0 {
                    score /= 100.0;
                }
                if score >= 0.75 {
                    Confidence::High
                } else if score >= 0.4 {
                    Confidence::Medium
                } else {
                    Confidence::Low
                }
            }
            _ => Confidence::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "high" | "critical" | "p1" => Priority::High,
            "low" | "p3" => Priority::Low,
            _ => Priority::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Where a single failure classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Model,
    Heuristic,
}

/// Whether the whole result came from the model or the local fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    pub test_id: String,
    pub test_name: String,
    pub root_cause: String,
    pub category: DefectCategory,
    pub confidence: Confidence,
    pub evidence: Vec<String>,
    pub suggested_fix: String,
    pub source: ClassificationSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePattern {
    pub name: String,
    pub description: String,
    pub affected_tests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub priority: Priority,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub analysis_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub source: AnalysisSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub summary: String,
    /// One entry per failed test, in report order.
    pub failures: Vec<FailureAnalysis>,
    pub patterns: Vec<FailurePattern>,
    pub recommendations: Vec<Recommendation>,
    /// Tests the model found in the raw digest that the parser missed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_tests: Vec<TestCase>,
}

impl AnalysisResult {
    pub fn failure(&self, test_id: &str) -> Option<&FailureAnalysis> {
        self.failures.iter().find(|f| f.test_id == test_id)
    }

    pub fn failures_in(&self, category: DefectCategory) -> impl Iterator<Item = &FailureAnalysis> {
        self.failures.iter().filter(move |f| f.category == category)
    }
}

/// Saved output of `analyze`, read back by `export`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageReport {
    pub report_name: String,
    pub parsed_at: DateTime<Utc>,
    pub test_cases: Vec<TestCase>,
    pub summary: crate::model::RunSummary,
    pub analysis: AnalysisResult,
}

impl TriageReport {
    pub fn new(report_name: impl Into<String>, report: ParsedReport, analysis: AnalysisResult) -> Self {
        Self {
            report_name: report_name.into(),
            parsed_at: Utc::now(),
            test_cases: report.test_cases,
            summary: report.summary,
            analysis,
        }
    }
}

/// Connection settings for the analysis endpoint.
#[derive(Debug, Clone)]
pub struct AiSettings {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
}

impl AiSettings {
    pub fn load(store: &SettingsStore) -> Result<Self> {
        Ok(Self {
            api_key: store.require(OPENAI_API_KEY)?,
            model: store
                .resolve(OPENAI_MODEL)?
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            endpoint: store
                .resolve(OPENAI_ENDPOINT)?
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Request assembly
// ---------------------------------------------------------------------------

/// The analysis input: the parser output, borrowed unmodified.
#[derive(Debug)]
pub struct AnalysisRequest<'a> {
    pub test_cases: &'a [TestCase],
    pub raw_content: &'a str,
}

const SYSTEM_PROMPT: &str = "You are a senior QA engineer triaging automated test failures from an Extent HTML report. \
Classify every failed test into exactly one category: application_defect, automation_script_defect, \
test_data_issue, environment_issue, configuration_issue, flaky_test. \
Respond with a single JSON object and nothing else.";

impl<'a> AnalysisRequest<'a> {
    pub fn from_report(report: &'a ParsedReport) -> Self {
        Self {
            test_cases: &report.test_cases,
            raw_content: &report.raw_content,
        }
    }

    /// Compact view of one test for the prompt: screenshots are reduced to a
    /// count and long texts are cut.
    fn prompt_view(tc: &TestCase) -> Value {
        let logs: Vec<String> = tc
            .logs
            .iter()
            .take(PROMPT_MAX_LOGS)
            .map(|l| truncate(l, PROMPT_MAX_LOG_CHARS))
            .collect();
        json!({
            "id": tc.id,
            "name": tc.name,
            "className": tc.class_name,
            "status": tc.status,
            "duration": tc.duration,
            "errorMessage": tc.error_message,
            "stackTrace": tc.stack_trace.as_deref().map(|s| truncate(s, PROMPT_MAX_STACK_CHARS)),
            "logs": logs,
            "stepsToReproduce": tc.steps_to_reproduce,
            "screenshots": tc.screenshots.len(),
        })
    }

    pub fn prompt(&self) -> String {
        let tests: Vec<Value> = self.test_cases.iter().map(Self::prompt_view).collect();
        format!(
            "Analyze the following test results.

Return a JSON object with exactly these fields:
{{
  \"summary\": \"one paragraph overview of the run\",
  \"failureAnalysis\": {{
    \"<test id>\": {{
      \"rootCause\": \"string\",
      \"category\": \"application_defect | automation_script_defect | test_data_issue | environment_issue | configuration_issue | flaky_test\",
      \"confidence\": \"high | medium | low\",
      \"evidence\": [\"string\"],
      \"suggestedFix\": \"string\"
    }}
  }},
  \"patterns\": [{{\"name\": \"string\", \"description\": \"string\", \"affectedTests\": [\"<test id>\"]}}],
  \"recommendations\": [{{\"priority\": \"high | medium | low\", \"title\": \"string\", \"description\": \"string\"}}],
  \"additionalTests\": [{{\"name\": \"string\", \"status\": \"pass | fail | skip\", \"errorMessage\": \"string\"}}]
}}

Key failureAnalysis by the test ids below. Only list additionalTests for tests that appear in the raw report content but not in the structured test cases.

Structured test cases:
{}

Raw report content:
{}",
            serde_json::to_string_pretty(&tests).unwrap_or_default(),
            self.raw_content
        )
    }

    pub fn chat_body(&self, model: &str) -> Value {
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": self.prompt() }
            ],
            "temperature": 0.1,
            "response_format": { "type": "json_object" }
        })
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max).collect();
        cut.push_str("...");
        cut
    }
}

// ---------------------------------------------------------------------------
// Remote call
// ---------------------------------------------------------------------------

/// Map a non-success status to the error the user sees.
pub fn classify_http_error(status: u16, body: String) -> TriageError {
    match status {
        429 if body.contains("insufficient_quota") => TriageError::QuotaExhausted { body },
        402 => TriageError::QuotaExhausted { body },
        429 => TriageError::RateLimited { body },
        401 | 403 => TriageError::Unauthorized {
            service: SERVICE,
            status,
            body,
        },
        500..=599 => TriageError::Unavailable {
            service: SERVICE,
            reason: format!("HTTP {}: {}", status, body),
        },
        _ => TriageError::Upstream {
            service: SERVICE,
            status,
            body,
        },
    }
}

/// Send one analysis request.
///
/// Transport and HTTP failures are returned as errors. A response that
/// arrives but cannot be validated is replaced by [`fallback_analysis`].
pub async fn request_analysis(settings: &AiSettings, report: &ParsedReport) -> Result<AnalysisResult> {
    let request = AnalysisRequest::from_report(report);
    let body = request.chat_body(&settings.model);

    info!(
        model = %settings.model,
        tests = report.test_cases.len(),
        "requesting failure analysis"
    );

    let client = reqwest::Client::new();
    let response = client
        .post(&settings.endpoint)
        .bearer_auth(&settings.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| TriageError::Unavailable {
            service: SERVICE,
            reason: e.to_string(),
        })?;

    let status = response.status();
    debug!(%status, "analysis service responded");
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        return Err(classify_http_error(status.as_u16(), error_body));
    }

    let envelope: Value = match response.json().await {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "analysis response was not JSON, using fallback analysis");
            return Ok(fallback_analysis(report));
        }
    };

    Ok(analysis_from_envelope(&envelope, report, &settings.model))
}

/// Turn a chat completion envelope into an analysis. Content that is
/// missing or fails validation yields [`fallback_analysis`].
pub fn analysis_from_envelope(envelope: &Value, report: &ParsedReport, model: &str) -> AnalysisResult {
    let validated = envelope
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| TriageError::MalformedResponse {
            reason: "no message content in completion".to_string(),
        })
        .and_then(|content| validate_analysis_response(content, report));

    match validated {
        Ok(mut result) => {
            result.model = Some(model.to_string());
            info!(
                failures = result.failures.len(),
                patterns = result.patterns.len(),
                "analysis completed"
            );
            result
        }
        Err(e) => {
            warn!(error = %e, "using fallback analysis");
            fallback_analysis(report)
        }
    }
}

// ---------------------------------------------------------------------------
// Response validation
// ---------------------------------------------------------------------------

lazy_static! {
    static ref CODE_FENCE_RE: Regex = Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```")
        .expect("Failed to compile CODE_FENCE_RE regex");
}

/// Recover a JSON object from model output that may be wrapped in a code
/// fence or surrounded by prose.
fn extract_json_object(raw: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = raw.trim();
    let mut candidates: Vec<&str> = vec![trimmed];
    if let Some(caps) = CODE_FENCE_RE.captures(trimmed) {
        if let Some(inner) = caps.get(1) {
            candidates.push(inner.as_str());
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            candidates.push(&trimmed[start..=end]);
        }
    }
    candidates.into_iter().find_map(|c| match serde_json::from_str::<Value>(c) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    })
}

fn string_field(entry: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| entry.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                other if !other.is_null() => Some(other.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Resolve the key the model used (id or name) to a failed test.
fn resolve_failed_test<'r>(report: &'r ParsedReport, key: &str) -> Option<&'r TestCase> {
    let key = key.trim();
    report
        .failed_tests()
        .find(|t| t.id == key)
        .or_else(|| report.failed_tests().find(|t| t.name == key))
}

fn failure_from_entry(tc: &TestCase, entry: &Value) -> FailureAnalysis {
    let local = classify_locally(tc);
    let category = entry
        .get("category")
        .and_then(Value::as_str)
        .and_then(DefectCategory::parse);

    FailureAnalysis {
        test_id: tc.id.clone(),
        test_name: tc.name.clone(),
        root_cause: string_field(entry, &["rootCause", "root_cause"]).unwrap_or(local.root_cause),
        category: category.unwrap_or(local.category),
        confidence: match category {
            Some(_) => Confidence::from_value(entry.get("confidence")),
            None => local.confidence,
        },
        evidence: {
            let evidence = string_list(entry.get("evidence"));
            if evidence.is_empty() {
                local.evidence
            } else {
                evidence
            }
        },
        suggested_fix: string_field(entry, &["suggestedFix", "suggested_fix", "fix"])
            .unwrap_or(local.suggested_fix),
        source: if category.is_some() {
            ClassificationSource::Model
        } else {
            ClassificationSource::Heuristic
        },
    }
}

fn parse_failures(
    obj: &serde_json::Map<String, Value>,
    report: &ParsedReport,
) -> Vec<FailureAnalysis> {
    let mut classified: HashMap<String, FailureAnalysis> = HashMap::new();
    let section = ["failureAnalysis", "failure_analysis", "failures", "classifications"]
        .iter()
        .find_map(|k| obj.get(*k));

    let entries: Vec<(String, &Value)> = match section {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                string_field(item, &["testId", "test_id", "id", "testName", "name"])
                    .map(|key| (key, item))
            })
            .collect(),
        _ => Vec::new(),
    };

    for (key, entry) in entries {
        match resolve_failed_test(report, &key) {
            Some(tc) if entry.is_object() => {
                classified.insert(tc.id.clone(), failure_from_entry(tc, entry));
            }
            _ => debug!(key = %key, "ignoring classification for unknown or non-failed test"),
        }
    }

    report
        .failed_tests()
        .map(|tc| {
            classified.remove(&tc.id).unwrap_or_else(|| {
                debug!(test = %tc.id, "model omitted failed test, classifying locally");
                classify_locally(tc)
            })
        })
        .collect()
}

fn parse_patterns(obj: &serde_json::Map<String, Value>) -> Vec<FailurePattern> {
    let Some(Value::Array(items)) = obj.get("patterns") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(FailurePattern {
                name: s.trim().to_string(),
                description: s.trim().to_string(),
                affected_tests: Vec::new(),
            }),
            Value::Object(_) => {
                let name = string_field(item, &["name", "pattern", "title"]);
                let description = string_field(item, &["description", "details"]);
                if name.is_none() && description.is_none() {
                    return None;
                }
                Some(FailurePattern {
                    name: name.clone().or_else(|| description.clone()).unwrap_or_default(),
                    description: description.or(name).unwrap_or_default(),
                    affected_tests: string_list(
                        item.get("affectedTests").or_else(|| item.get("affected_tests")),
                    ),
                })
            }
            _ => None,
        })
        .collect()
}

fn parse_recommendations(obj: &serde_json::Map<String, Value>) -> Vec<Recommendation> {
    let Some(Value::Array(items)) = obj.get("recommendations") else {
        return Vec::new();
    };
    let mut recommendations: Vec<Recommendation> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(Recommendation {
                priority: Priority::Medium,
                title: s.trim().to_string(),
                description: String::new(),
            }),
            Value::Object(_) => {
                let title = string_field(item, &["title", "recommendation", "action"]);
                let description = string_field(item, &["description", "details"]);
                let title = title.or_else(|| description.clone())?;
                Some(Recommendation {
                    priority: string_field(item, &["priority"])
                        .map(|p| Priority::parse(&p))
                        .unwrap_or_default(),
                    title,
                    description: description.unwrap_or_default(),
                })
            }
            _ => None,
        })
        .collect();
    recommendations.sort_by_key(|r| r.priority);
    recommendations
}

fn parse_status(raw: &str) -> TestStatus {
    let raw = raw.to_lowercase();
    if raw.starts_with("fail") || raw.starts_with("error") {
        TestStatus::Fail
    } else if raw.starts_with("skip") {
        TestStatus::Skip
    } else {
        TestStatus::Pass
    }
}

fn parse_additional_tests(
    obj: &serde_json::Map<String, Value>,
    report: &ParsedReport,
) -> Vec<TestCase> {
    let Some(Value::Array(items)) = obj.get("additionalTests") else {
        return Vec::new();
    };
    let known: HashSet<&str> = report.test_cases.iter().map(|t| t.name.as_str()).collect();
    let mut extra: Vec<TestCase> = Vec::new();
    for item in items {
        let Some(name) = string_field(item, &["name", "testName"]) else {
            continue;
        };
        if known.contains(name.as_str()) || extra.iter().any(|t| t.name == name) {
            continue;
        }
        let position = report.test_cases.len() + extra.len();
        let status = string_field(item, &["status"])
            .map(|s| parse_status(&s))
            .unwrap_or_default();
        let mut tc = TestCase::placeholder(position, status);
        tc.name = name;
        tc.class_name = string_field(item, &["className", "class_name"])
            .unwrap_or_else(|| UNKNOWN_CLASS.to_string());
        if status == TestStatus::Fail {
            tc.error_message = string_field(item, &["errorMessage", "error_message", "error"]);
        }
        extra.push(tc);
    }
    extra
}

/// Strict parse-then-validate of the model's message content.
///
/// Optional fields are never trusted: every section falls back to a fully
/// specified default, and failed tests the model skipped are classified
/// locally. Only content with no recoverable JSON object, or an object with
/// none of the expected sections, is rejected.
pub fn validate_analysis_response(raw: &str, report: &ParsedReport) -> Result<AnalysisResult> {
    let obj = extract_json_object(raw).ok_or_else(|| TriageError::MalformedResponse {
        reason: "no JSON object found in model output".to_string(),
    })?;

    const SECTIONS: &[&str] = &[
        "summary",
        "failureAnalysis",
        "failure_analysis",
        "failures",
        "classifications",
        "patterns",
        "recommendations",
    ];
    if !SECTIONS.iter().any(|k| obj.contains_key(*k)) {
        return Err(TriageError::MalformedResponse {
            reason: "response has none of the expected sections".to_string(),
        });
    }

    let summary = match obj.get("summary") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Object(_)) => obj
            .get("summary")
            .and_then(|s| string_field(s, &["overview", "text", "description"]))
            .unwrap_or_else(|| default_summary(report)),
        _ => default_summary(report),
    };

    Ok(AnalysisResult {
        analysis_id: Uuid::new_v4(),
        generated_at: Utc::now(),
        source: AnalysisSource::Model,
        model: None,
        summary,
        failures: parse_failures(&obj, report),
        patterns: parse_patterns(&obj),
        recommendations: parse_recommendations(&obj),
        additional_tests: parse_additional_tests(&obj, report),
    })
}

// ---------------------------------------------------------------------------
// Local fallback
// ---------------------------------------------------------------------------

struct LocalRule {
    pattern: Regex,
    category: DefectCategory,
    root_cause: &'static str,
    fix: &'static str,
}

fn rule(pattern: &str, category: DefectCategory, root_cause: &'static str, fix: &'static str) -> LocalRule {
    LocalRule {
        pattern: Regex::new(pattern).expect("Failed to compile local classification regex"),
        category,
        root_cause,
        fix,
    }
}

lazy_static! {
    // Checked in order; environment signals come before assertion text
    // because a 503 page usually also fails an assertion.
    static ref LOCAL_RULES: Vec<LocalRule> = vec![
        rule(
            r"(?i)connection (refused|reset|timed out)|unknownhost|econnrefused|service unavailable|\b50[234]\b|socket|network is unreachable",
            DefectCategory::EnvironmentIssue,
            "A dependent service or network resource was unavailable during the run",
            "Check the health of the test environment and its dependent services, then re-run",
        ),
        rule(
            r"(?i)nosuchelement|staleelement|element (is )?not (found|visible|interactable)|elementclickintercepted|invalidselector|timeoutexception|waiting for (element|selector)|locator",
            DefectCategory::AutomationScriptDefect,
            "The automation script could not locate or interact with a page element",
            "Update the locator or add an explicit wait for the element state the step needs",
        ),
        rule(
            r"(?i)sessionnotcreated|classnotfound|property not found|missing (property|setting|configuration)|config(uration)? (error|invalid)|driver .*version",
            DefectCategory::ConfigurationIssue,
            "The test run was misconfigured (driver, properties or runtime settings)",
            "Verify the run configuration, driver versions and required properties",
        ),
        rule(
            r"(?i)test data|invalid (input|data)|duplicate (key|entry)|no such user|constraint violation|dataprovider|numberformatexception|illegalargumentexception",
            DefectCategory::TestDataIssue,
            "The test used data that is missing, stale or invalid",
            "Refresh or isolate the test data used by this test",
        ),
        rule(
            r"(?i)flaky|intermittent|race condition|retry(ing)? attempt",
            DefectCategory::FlakyTest,
            "The failure shows signs of non-deterministic behaviour",
            "Quarantine the test and stabilize its timing or shared state",
        ),
        rule(
            r"(?i)assert|expected|but (was|found)|status code|internal server error",
            DefectCategory::ApplicationDefect,
            "The application returned a result different from the expected behaviour",
            "Reproduce the scenario manually and raise a defect against the application",
        ),
    ];
}

/// Regex classification of one failed test, used when the model gives
/// nothing usable for it.
pub fn classify_locally(tc: &TestCase) -> FailureAnalysis {
    let logs = tc.logs.join("\n");
    let haystack = [
        tc.error_message.as_deref().unwrap_or(""),
        tc.stack_trace.as_deref().unwrap_or(""),
        logs.as_str(),
    ]
    .join("\n");

    let mut evidence = Vec::new();
    if let Some(message) = &tc.error_message {
        evidence.push(message.clone());
    }
    if let Some(first) = tc.stack_trace.as_deref().and_then(|s| s.lines().next()) {
        if !evidence.iter().any(|e| e == first) {
            evidence.push(first.trim().to_string());
        }
    }

    let matched = LOCAL_RULES.iter().find(|r| r.pattern.is_match(&haystack));
    let (category, confidence, root_cause, fix) = match matched {
        Some(r) => (r.category, Confidence::Medium, r.root_cause, r.fix),
        None => (
            DefectCategory::ApplicationDefect,
            Confidence::Low,
            "The report does not contain enough detail to determine the cause",
            "Review the full test output and screenshots for this failure",
        ),
    };

    FailureAnalysis {
        test_id: tc.id.clone(),
        test_name: tc.name.clone(),
        root_cause: root_cause.to_string(),
        category,
        confidence,
        evidence,
        suggested_fix: fix.to_string(),
        source: ClassificationSource::Heuristic,
    }
}

fn default_summary(report: &ParsedReport) -> String {
    let s = &report.summary;
    format!(
        "Analyzed {} tests: {} passed, {} failed, {} skipped ({:.1}% pass rate).",
        s.total, s.passed, s.failed, s.skipped, s.pass_rate
    )
}

fn category_recommendation(category: DefectCategory, count: usize) -> Recommendation {
    let (priority, title, description) = match category {
        DefectCategory::ApplicationDefect => (
            Priority::High,
            "Raise application defects",
            "Export the application defects to the issue tracker and assign them to the owning team.",
        ),
        DefectCategory::EnvironmentIssue => (
            Priority::High,
            "Stabilize the test environment",
            "Check service availability and network access of the environment before the next run.",
        ),
        DefectCategory::ConfigurationIssue => (
            Priority::Medium,
            "Fix run configuration",
            "Align driver versions and required properties with the target environment.",
        ),
        DefectCategory::AutomationScriptDefect => (
            Priority::Medium,
            "Repair automation scripts",
            "Update locators and waits in the affected automation scripts.",
        ),
        DefectCategory::TestDataIssue => (
            Priority::Medium,
            "Refresh test data",
            "Recreate or isolate the data sets used by the failing tests.",
        ),
        DefectCategory::FlakyTest => (
            Priority::Low,
            "Quarantine flaky tests",
            "Track the flaky tests separately until their timing issues are fixed.",
        ),
    };
    Recommendation {
        priority,
        title: title.to_string(),
        description: format!("{} ({} affected)", description, count),
    }
}

/// Deterministic analysis built only from locally available data.
pub fn fallback_analysis(report: &ParsedReport) -> AnalysisResult {
    let failures: Vec<FailureAnalysis> = report.failed_tests().map(classify_locally).collect();

    let mut by_category: BTreeMap<DefectCategory, Vec<String>> = BTreeMap::new();
    for f in &failures {
        by_category.entry(f.category).or_default().push(f.test_id.clone());
    }

    let mut patterns: Vec<FailurePattern> = by_category
        .iter()
        .filter(|(_, ids)| ids.len() >= 2)
        .map(|(category, ids)| FailurePattern {
            name: format!("Repeated {}", category.label()),
            description: format!(
                "{} failures share the {} classification",
                ids.len(),
                category.label()
            ),
            affected_tests: ids.clone(),
        })
        .collect();

    let mut by_message: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for tc in report.failed_tests() {
        if let Some(message) = tc.error_message.as_deref() {
            by_message.entry(message).or_default().push(tc.id.clone());
        }
    }
    patterns.extend(
        by_message
            .into_iter()
            .filter(|(_, ids)| ids.len() >= 2)
            .map(|(message, ids)| FailurePattern {
                name: "Shared error message".to_string(),
                description: format!("{} failures report: {}", ids.len(), message),
                affected_tests: ids,
            }),
    );

    let mut recommendations: Vec<Recommendation> = by_category
        .iter()
        .map(|(category, ids)| category_recommendation(*category, ids.len()))
        .collect();
    if recommendations.is_empty() {
        recommendations.push(Recommendation {
            priority: Priority::Low,
            title: "No failures to triage".to_string(),
            description: "All extracted tests passed or were skipped.".to_string(),
        });
    }
    recommendations.sort_by_key(|r| r.priority);

    AnalysisResult {
        analysis_id: Uuid::new_v4(),
        generated_at: Utc::now(),
        source: AnalysisSource::Fallback,
        model: None,
        summary: format!(
            "{} Automated classification was unavailable; failures were classified by local heuristics.",
            default_summary(report)
        ),
        failures,
        patterns,
        recommendations,
        additional_tests: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtractionTier;

    fn failed(position: usize, message: &str) -> TestCase {
        let mut tc = TestCase::placeholder(position, TestStatus::Fail);
        tc.name = format!("failing {}", position + 1);
        tc.error_message = Some(message.to_string());
        tc
    }

    fn report(tests: Vec<TestCase>) -> ParsedReport {
        ParsedReport::new(tests, "raw".to_string(), ExtractionTier::Structured)
    }

    #[test]
    fn category_parse_is_lenient() {
        assert_eq!(
            DefectCategory::parse("Application Defect"),
            Some(DefectCategory::ApplicationDefect)
        );
        assert_eq!(DefectCategory::parse("flaky-test"), Some(DefectCategory::FlakyTest));
        assert_eq!(DefectCategory::parse("cosmic rays"), None);
    }

    #[test]
    fn confidence_accepts_labels_and_scores() {
        assert_eq!(Confidence::from_value(Some(&json!("HIGH"))), Confidence::High);
        assert_eq!(Confidence::from_value(Some(&json!(0.2))), Confidence::Low);
        assert_eq!(Confidence::from_value(Some(&json!(85))), Confidence::High);
        assert_eq!(Confidence::from_value(None), Confidence::Medium);
    }

    #[test]
    fn http_errors_are_distinguished() {
        assert!(matches!(classify_http_error(429, "slow down".into()), TriageError::RateLimited { .. }));
        assert!(matches!(
            classify_http_error(429, r#"{"error":{"code":"insufficient_quota"}}"#.into()),
            TriageError::QuotaExhausted { .. }
        ));
        assert!(matches!(classify_http_error(401, String::new()), TriageError::Unauthorized { .. }));
        assert!(matches!(classify_http_error(503, String::new()), TriageError::Unavailable { .. }));
        assert!(matches!(classify_http_error(400, String::new()), TriageError::Upstream { .. }));
    }

    #[test]
    fn chat_body_carries_test_ids_and_raw_content() {
        let r = report(vec![failed(0, "AssertionError: boom")]);
        let body = AnalysisRequest::from_report(&r).chat_body(DEFAULT_MODEL);
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["response_format"]["type"], "json_object");
        let prompt = body["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("\"id\": \"test-1\""));
        assert!(prompt.contains("AssertionError: boom"));
        assert!(prompt.ends_with("Raw report content:\nraw"));
    }

    #[test]
    fn envelope_with_valid_content_is_a_model_analysis() {
        let r = report(vec![failed(0, "AssertionError: boom")]);
        let envelope = json!({
            "choices": [{"message": {"role": "assistant", "content":
                r#"{"summary": "ok", "failureAnalysis": {"test-1": {"category": "flaky_test"}}}"#}}]
        });
        let result = analysis_from_envelope(&envelope, &r, "gpt-test");
        assert_eq!(result.source, AnalysisSource::Model);
        assert_eq!(result.model.as_deref(), Some("gpt-test"));
        assert_eq!(result.failure("test-1").unwrap().category, DefectCategory::FlakyTest);
    }

    #[test]
    fn envelope_without_usable_content_falls_back() {
        let r = report(vec![failed(0, "Connection refused")]);
        for envelope in [
            json!({"choices": []}),
            json!({"choices": [{"message": {"content": null}}]}),
            json!({"choices": [{"message": {"content": "I cannot help with that."}}]}),
        ] {
            let result = analysis_from_envelope(&envelope, &r, "gpt-test");
            assert_eq!(result.source, AnalysisSource::Fallback, "{}", envelope);
            assert!(result.model.is_none());
            assert_eq!(result.failures.len(), 1);
        }
    }

    #[test]
    fn prompt_reduces_screenshots_to_a_count() {
        let mut tc = failed(0, "AssertionError: boom");
        tc.screenshots.push(crate::model::Screenshot {
            name: "shot".into(),
            mime_type: "image/png".into(),
            base64_data: "SECRETPAYLOAD".into(),
        });
        let r = report(vec![tc]);
        let prompt = AnalysisRequest::from_report(&r).prompt();
        assert!(!prompt.contains("SECRETPAYLOAD"));
        assert!(prompt.contains("\"screenshots\": 1"));
    }

    #[test]
    fn validator_accepts_fenced_json_and_resolves_names() {
        let r = report(vec![failed(0, "AssertionError: boom"), failed(1, "Connection refused")]);
        let raw = r#"Here is the analysis:
```json
{
  "summary": "Two failures.",
  "failureAnalysis": {
    "failing 1": {"rootCause": "Totals wrong", "category": "Application Defect", "confidence": "high",
                  "evidence": ["boom"], "suggestedFix": "Fix totals"}
  },
  "recommendations": [
    {"priority": "low", "title": "Later"},
    {"priority": "high", "title": "Now"}
  ]
}
```"#;
        let result = validate_analysis_response(raw, &r).unwrap();
        assert_eq!(result.summary, "Two failures.");
        let first = result.failure("test-1").unwrap();
        assert_eq!(first.category, DefectCategory::ApplicationDefect);
        assert_eq!(first.confidence, Confidence::High);
        assert_eq!(first.source, ClassificationSource::Model);
        // Omitted by the model, filled locally.
        let second = result.failure("test-2").unwrap();
        assert_eq!(second.category, DefectCategory::EnvironmentIssue);
        assert_eq!(second.source, ClassificationSource::Heuristic);
        assert_eq!(result.recommendations[0].title, "Now");
    }

    #[test]
    fn validator_replaces_unknown_category_and_defaults_confidence() {
        let r = report(vec![failed(0, "NoSuchElementException: #buy")]);
        let raw = r#"{"failureAnalysis": {"test-1": {"rootCause": "?", "category": "gremlins"}}}"#;
        let result = validate_analysis_response(raw, &r).unwrap();
        let f = result.failure("test-1").unwrap();
        assert_eq!(f.category, DefectCategory::AutomationScriptDefect);
        assert_eq!(f.source, ClassificationSource::Heuristic);
        assert_eq!(f.root_cause, "?");

        let raw = r#"{"failureAnalysis": {"test-1": {"category": "flaky_test"}}}"#;
        let result = validate_analysis_response(raw, &r).unwrap();
        assert_eq!(result.failure("test-1").unwrap().confidence, Confidence::Medium);
    }

    #[test]
    fn validator_rejects_prose_and_foreign_shapes() {
        let r = report(vec![]);
        assert!(matches!(
            validate_analysis_response("I cannot help with that.", &r),
            Err(TriageError::MalformedResponse { .. })
        ));
        assert!(matches!(
            validate_analysis_response(r#"{"answer": 42}"#, &r),
            Err(TriageError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn validator_collects_additional_tests_after_known_ones() {
        let r = report(vec![failed(0, "AssertionError: boom")]);
        let raw = r#"{"summary": "x", "additionalTests": [
            {"name": "failing 1", "status": "fail"},
            {"name": "hidden checkout", "status": "FAILED", "errorMessage": "500"},
            {"status": "pass"}
        ]}"#;
        let result = validate_analysis_response(raw, &r).unwrap();
        assert_eq!(result.additional_tests.len(), 1);
        assert_eq!(result.additional_tests[0].id, "test-2");
        assert_eq!(result.additional_tests[0].status, TestStatus::Fail);
        assert_eq!(result.additional_tests[0].error_message.as_deref(), Some("500"));
    }

    #[test]
    fn local_rules_classify_common_failures() {
        let cases = [
            ("org.openqa.selenium.NoSuchElementException: no such element", DefectCategory::AutomationScriptDefect),
            ("java.net.ConnectException: Connection refused", DefectCategory::EnvironmentIssue),
            ("SessionNotCreatedException: driver version mismatch", DefectCategory::ConfigurationIssue),
            ("Duplicate entry 'user1' for key 'email'", DefectCategory::TestDataIssue),
            ("AssertionError: expected [3] but found [2]", DefectCategory::ApplicationDefect),
        ];
        for (message, expected) in cases {
            assert_eq!(classify_locally(&failed(0, message)).category, expected, "{}", message);
        }
        let unknown = classify_locally(&failed(0, "something odd"));
        assert_eq!(unknown.confidence, Confidence::Low);
    }

    #[test]
    fn fallback_groups_patterns_and_orders_recommendations() {
        let r = report(vec![
            failed(0, "AssertionError: total"),
            failed(1, "AssertionError: total"),
            failed(2, "Connection refused"),
            TestCase::placeholder(3, TestStatus::Pass),
        ]);
        let result = fallback_analysis(&r);
        assert_eq!(result.source, AnalysisSource::Fallback);
        assert_eq!(result.failures.len(), 3);
        assert!(result.patterns.iter().any(|p| p.name == "Repeated Application Defect"));
        assert!(result.patterns.iter().any(|p| p.name == "Shared error message"));
        assert!(result.recommendations.iter().all(|r| r.priority == Priority::High));
        assert_eq!(result.failures_in(DefectCategory::ApplicationDefect).count(), 2);
    }

    #[test]
    fn failures_keep_report_order_past_nine_tests() {
        let r = report((0..11).map(|i| failed(i, "AssertionError: x")).collect());
        let fallback = fallback_analysis(&r);
        let ids: Vec<&str> = fallback
            .failures
            .iter()
            .map(|f| f.test_id.as_str())
            .collect();
        assert_eq!(ids[1], "test-2");
        assert_eq!(ids[9], "test-10");
        assert_eq!(ids[10], "test-11");

        // Model classifications are reordered to match the report.
        let raw = r#"{"failureAnalysis": {"test-10": {"category": "flaky_test"}, "test-2": {"category": "flaky_test"}}}"#;
        let result = validate_analysis_response(raw, &r).unwrap();
        let ids: Vec<&str> = result.failures.iter().map(|f| f.test_id.as_str()).collect();
        assert_eq!(&ids[..3], &["test-1", "test-2", "test-3"]);
        assert_eq!(ids[9], "test-10");
    }

    #[test]
    fn fallback_without_failures_still_recommends() {
        let r = report(vec![TestCase::placeholder(0, TestStatus::Pass)]);
        let result = fallback_analysis(&r);
        assert!(result.failures.is_empty());
        assert_eq!(result.recommendations.len(), 1);
    }
}
