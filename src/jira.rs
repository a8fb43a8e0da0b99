//! Jira Cloud boundary: turns one analyzed failure into a Bug issue and
//! attaches the screenshots recovered from the report.

use base64::Engine as _;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::analysis::{Confidence, DefectCategory, FailureAnalysis, TriageReport};
use crate::error::{Result, TriageError};
use crate::model::{Screenshot, TestCase};
use crate::settings::{SettingsStore, JIRA_API_TOKEN, JIRA_BASE_URL, JIRA_EMAIL, JIRA_PROJECT_KEY};

const SERVICE: &str = "Jira";
const ISSUE_TYPE: &str = "Bug";
const MAX_SUMMARY_CHARS: usize = 255;
const MAX_STACK_CHARS: usize = 3_000;
pub const TRIAGE_LABEL: &str = "automated-triage";

#[derive(Clone)]
pub struct JiraCredentials {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub project_key: String,
}

impl JiraCredentials {
    pub fn load(store: &SettingsStore) -> Result<Self> {
        Ok(Self {
            base_url: store.require(JIRA_BASE_URL)?.trim_end_matches('/').to_string(),
            email: store.require(JIRA_EMAIL)?,
            api_token: store.require(JIRA_API_TOKEN)?,
            project_key: store.require(JIRA_PROJECT_KEY)?,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/rest/api/3/{}", self.base_url, path)
    }
}

/// Everything needed to create one issue, independent of the project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueDraft {
    pub test_id: String,
    pub summary: String,
    pub description: Value,
    pub priority: String,
    pub labels: Vec<String>,
    #[serde(skip)]
    pub screenshots: Vec<Screenshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedIssue {
    pub key: String,
    pub url: String,
    pub attachments_uploaded: usize,
    pub attachment_failures: Vec<String>,
}

/// Result of exporting a batch of drafts: every issue that was created, and
/// the test id and error of every draft that was not.
#[derive(Debug, Default)]
pub struct ExportOutcome {
    pub created: Vec<CreatedIssue>,
    pub failed: Vec<(String, TriageError)>,
}

impl ExportOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// Atlassian Document Format building blocks.

fn text(value: &str) -> Value {
    json!({ "type": "text", "text": value })
}

fn strong(value: &str) -> Value {
    json!({ "type": "text", "text": value, "marks": [{ "type": "strong" }] })
}

fn heading(value: &str) -> Value {
    json!({ "type": "heading", "attrs": { "level": 3 }, "content": [text(value)] })
}

fn paragraph(nodes: Vec<Value>) -> Value {
    json!({ "type": "paragraph", "content": nodes })
}

fn list(kind: &str, items: &[String]) -> Value {
    let items: Vec<Value> = items
        .iter()
        .map(|item| json!({ "type": "listItem", "content": [paragraph(vec![text(item)])] }))
        .collect();
    json!({ "type": kind, "content": items })
}

fn code_block(value: &str) -> Value {
    json!({ "type": "codeBlock", "content": [text(value)] })
}

fn cut(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn jira_priority(confidence: Confidence) -> &'static str {
    match confidence {
        Confidence::High => "High",
        Confidence::Medium => "Medium",
        Confidence::Low => "Low",
    }
}

impl IssueDraft {
    pub fn from_failure(tc: &TestCase, analysis: &FailureAnalysis) -> Self {
        let mut content = vec![
            heading("Test"),
            paragraph(vec![strong("Name: "), text(&tc.name)]),
            paragraph(vec![strong("Class: "), text(&tc.class_name)]),
            paragraph(vec![
                strong("Duration: "),
                text(&format!("{:.2}s", tc.duration)),
            ]),
            heading("Root cause"),
            paragraph(vec![text(&analysis.root_cause)]),
            paragraph(vec![
                strong("Category: "),
                text(analysis.category.label()),
                strong(" Confidence: "),
                text(analysis.confidence.as_str()),
            ]),
        ];

        if let Some(message) = tc.error_message.as_deref().filter(|m| !m.is_empty()) {
            content.push(heading("Error message"));
            content.push(paragraph(vec![text(message)]));
        }
        if !analysis.evidence.is_empty() {
            content.push(heading("Evidence"));
            content.push(list("bulletList", &analysis.evidence));
        }
        if !analysis.suggested_fix.is_empty() {
            content.push(heading("Suggested fix"));
            content.push(paragraph(vec![text(&analysis.suggested_fix)]));
        }
        if !tc.steps_to_reproduce.is_empty() {
            content.push(heading("Steps to reproduce"));
            content.push(list("orderedList", &tc.steps_to_reproduce));
        }
        if let Some(stack) = tc.stack_trace.as_deref().filter(|s| !s.is_empty()) {
            content.push(heading("Stack trace"));
            content.push(code_block(&cut(stack, MAX_STACK_CHARS)));
        }

        Self {
            test_id: tc.id.clone(),
            summary: cut(
                &format!("[{}] {}", analysis.category.label(), tc.name),
                MAX_SUMMARY_CHARS,
            ),
            description: json!({ "type": "doc", "version": 1, "content": content }),
            priority: jira_priority(analysis.confidence).to_string(),
            labels: vec![
                TRIAGE_LABEL.to_string(),
                analysis.category.as_str().to_string(),
            ],
            screenshots: tc.screenshots.clone(),
        }
    }

    pub fn payload(&self, project_key: &str) -> Value {
        json!({
            "fields": {
                "project": { "key": project_key },
                "summary": self.summary,
                "description": self.description,
                "issuetype": { "name": ISSUE_TYPE },
                "priority": { "name": self.priority },
                "labels": self.labels,
            }
        })
    }
}

/// Pick the failures to export. With no ids every application defect is
/// selected; an unknown id is an error.
pub fn select_failures<'r>(
    report: &'r TriageReport,
    ids: &[String],
) -> Result<Vec<(&'r TestCase, &'r FailureAnalysis)>> {
    let lookup = |analysis: &'r FailureAnalysis| {
        report
            .test_cases
            .iter()
            .find(|t| t.id == analysis.test_id)
            .map(|tc| (tc, analysis))
    };

    if ids.is_empty() {
        return Ok(report
            .analysis
            .failures_in(DefectCategory::ApplicationDefect)
            .filter_map(lookup)
            .collect());
    }

    ids.iter()
        .map(|id| {
            report
                .analysis
                .failure(id)
                .and_then(lookup)
                .ok_or_else(|| TriageError::FailureNotFound { id: id.clone() })
        })
        .collect()
}

/// Render the tracker's own error text: `errorMessages` first, then the
/// per-field `errors` map.
pub fn parse_tracker_error(status: u16, body: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(messages) = value.get("errorMessages").and_then(Value::as_array) {
            parts.extend(
                messages
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string),
            );
        }
        if let Some(errors) = value.get("errors").and_then(Value::as_object) {
            parts.extend(errors.iter().map(|(field, message)| match message.as_str() {
                Some(m) => format!("{}: {}", field, m),
                None => format!("{}: {}", field, message),
            }));
        }
    }
    if parts.is_empty() {
        format!("HTTP {}", status)
    } else {
        parts.join("; ")
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type.to_lowercase().as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/svg+xml" => "svg",
        _ => "bin",
    }
}

pub fn attachment_file_name(screenshot: &Screenshot) -> String {
    let ext = extension_for(&screenshot.mime_type);
    let stem: String = screenshot
        .name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    let stem = if stem.is_empty() { "screenshot".to_string() } else { stem };
    if stem.to_lowercase().ends_with(&format!(".{}", ext)) {
        stem
    } else {
        format!("{}.{}", stem, ext)
    }
}

fn decode_screenshot(screenshot: &Screenshot) -> Result<Vec<u8>> {
    let compact: String = screenshot
        .base64_data
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| TriageError::Tracker {
            status: None,
            message: format!("screenshot '{}' is not valid base64: {}", screenshot.name, e),
        })
}

async fn upload_attachment(
    client: &reqwest::Client,
    creds: &JiraCredentials,
    key: &str,
    screenshot: &Screenshot,
) -> Result<()> {
    let bytes = decode_screenshot(screenshot)?;
    let part = Part::bytes(bytes)
        .file_name(attachment_file_name(screenshot))
        .mime_str(&screenshot.mime_type)?;
    let url = creds.api(&format!("issue/{}/attachments", urlencoding::encode(key)));

    let response = client
        .post(&url)
        .basic_auth(&creds.email, Some(&creds.api_token))
        .header("X-Atlassian-Token", "no-check")
        .multipart(Form::new().part("file", part))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TriageError::Tracker {
            status: Some(status.as_u16()),
            message: parse_tracker_error(status.as_u16(), &body),
        });
    }
    Ok(())
}

/// Create the issue, then upload its screenshots one at a time. Attachment
/// failures are collected, never fatal.
pub async fn create_issue(creds: &JiraCredentials, draft: &IssueDraft) -> Result<CreatedIssue> {
    let client = reqwest::Client::new();
    let payload = draft.payload(&creds.project_key);

    debug!(test = %draft.test_id, summary = %draft.summary, "creating issue");
    let response = client
        .post(creds.api("issue"))
        .basic_auth(&creds.email, Some(&creds.api_token))
        .header(ACCEPT, "application/json")
        .json(&payload)
        .send()
        .await
        .map_err(|e| TriageError::Unavailable {
            service: SERVICE,
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let code = status.as_u16();
        return Err(match code {
            401 | 403 => TriageError::Unauthorized {
                service: SERVICE,
                status: code,
                body: parse_tracker_error(code, &body),
            },
            _ => TriageError::Tracker {
                status: Some(code),
                message: parse_tracker_error(code, &body),
            },
        });
    }

    let created: Value = response.json().await?;
    let key = created
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| TriageError::Tracker {
            status: Some(status.as_u16()),
            message: "response did not include an issue key".to_string(),
        })?
        .to_string();
    info!(key = %key, test = %draft.test_id, "issue created");

    let mut uploaded = 0;
    let mut failures = Vec::new();
    for screenshot in &draft.screenshots {
        match upload_attachment(&client, creds, &key, screenshot).await {
            Ok(()) => uploaded += 1,
            Err(e) => {
                warn!(key = %key, screenshot = %screenshot.name, error = %e, "attachment upload failed");
                failures.push(format!("{}: {}", screenshot.name, e));
            }
        }
    }

    Ok(CreatedIssue {
        url: format!("{}/browse/{}", creds.base_url, key),
        key,
        attachments_uploaded: uploaded,
        attachment_failures: failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ClassificationSource;
    use crate::model::TestStatus;

    fn failure(tc: &TestCase, category: DefectCategory) -> FailureAnalysis {
        FailureAnalysis {
            test_id: tc.id.clone(),
            test_name: tc.name.clone(),
            root_cause: "Totals are wrong".to_string(),
            category,
            confidence: Confidence::High,
            evidence: vec!["expected 3 but found 2".to_string()],
            suggested_fix: "Fix the cart total".to_string(),
            source: ClassificationSource::Model,
        }
    }

    fn failed_test() -> TestCase {
        let mut tc = TestCase::placeholder(0, TestStatus::Fail);
        tc.name = "Checkout total".to_string();
        tc.error_message = Some("AssertionError".to_string());
        tc.stack_trace = Some("x".repeat(5_000));
        tc.steps_to_reproduce = vec!["Open cart".to_string(), "Pay".to_string()];
        tc
    }

    #[test]
    fn draft_carries_summary_priority_and_labels() {
        let tc = failed_test();
        let draft = IssueDraft::from_failure(&tc, &failure(&tc, DefectCategory::ApplicationDefect));
        assert_eq!(draft.summary, "[Application Defect] Checkout total");
        assert_eq!(draft.priority, "High");
        assert_eq!(draft.labels, vec!["automated-triage", "application_defect"]);

        let payload = draft.payload("QA");
        assert_eq!(payload["fields"]["project"]["key"], "QA");
        assert_eq!(payload["fields"]["issuetype"]["name"], "Bug");
        assert_eq!(payload["fields"]["description"]["type"], "doc");
    }

    #[test]
    fn description_bounds_the_stack_trace_and_orders_steps() {
        let tc = failed_test();
        let draft = IssueDraft::from_failure(&tc, &failure(&tc, DefectCategory::ApplicationDefect));
        let content = draft.description["content"].as_array().unwrap();
        let code = content.iter().find(|n| n["type"] == "codeBlock").unwrap();
        let stack = code["content"][0]["text"].as_str().unwrap();
        assert_eq!(stack.chars().count(), MAX_STACK_CHARS);
        let steps = content.iter().find(|n| n["type"] == "orderedList").unwrap();
        assert_eq!(steps["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn long_summaries_are_cut() {
        let mut tc = failed_test();
        tc.name = "n".repeat(400);
        let draft = IssueDraft::from_failure(&tc, &failure(&tc, DefectCategory::FlakyTest));
        assert_eq!(draft.summary.chars().count(), MAX_SUMMARY_CHARS);
    }

    #[test]
    fn tracker_errors_are_rendered_from_body() {
        let body = r#"{"errorMessages":["Project does not exist"],"errors":{"priority":"Priority is invalid"}}"#;
        assert_eq!(
            parse_tracker_error(400, body),
            "Project does not exist; priority: Priority is invalid"
        );
        assert_eq!(parse_tracker_error(502, "<html>bad gateway</html>"), "HTTP 502");
    }

    #[test]
    fn attachment_names_get_an_extension() {
        let shot = Screenshot {
            name: "login failure".to_string(),
            mime_type: "image/png".to_string(),
            base64_data: "QUJD".to_string(),
        };
        assert_eq!(attachment_file_name(&shot), "login_failure.png");
        assert_eq!(decode_screenshot(&shot).unwrap(), b"ABC");

        let bad = Screenshot {
            base64_data: "***".to_string(),
            ..shot
        };
        assert!(decode_screenshot(&bad).is_err());
    }
}
