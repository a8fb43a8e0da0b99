//! Error types for report-triage operations.
//!
//! Extraction misses never show up here: the parser always recovers with a
//! placeholder. Everything in [`TriageError`] is something the user has to
//! see, either because the input was rejected or because a remote boundary
//! (analysis service, issue tracker) refused the request.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for report-triage operations.
#[derive(Error, Debug)]
pub enum TriageError {
    // === Intake Errors ===
    /// The report file was rejected before parsing.
    #[error("Invalid report file '{path}': {reason}")]
    InvalidReport { path: PathBuf, reason: String },

    /// Reading or writing a local file failed.
    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // === Settings Errors ===
    /// A required setting has no value in the settings file or environment.
    #[error("Setting '{key}' is not configured. Run `report-triage settings set {key} <value>` first.")]
    MissingSetting { key: String },

    /// The settings file exists but could not be read back.
    #[error("Settings error: {0}")]
    Settings(String),

    // === Analysis Boundary Errors ===
    /// The analysis service rejected the request with HTTP 429.
    #[error("Analysis service rate limit reached (HTTP 429): {body}")]
    RateLimited { body: String },

    /// The analysis account has no remaining quota.
    #[error("Analysis service quota exhausted: {body}")]
    QuotaExhausted { body: String },

    /// Credentials were refused by a remote service.
    #[error("{service} rejected the credentials (HTTP {status}): {body}")]
    Unauthorized {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// A remote service could not be reached or reported itself unavailable.
    #[error("{service} is unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    /// Any other non-success response from the analysis service.
    #[error("{service} error (HTTP {status}): {body}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The analysis service answered, but not in the agreed shape.
    #[error("Malformed analysis response: {reason}")]
    MalformedResponse { reason: String },

    // === Issue Tracker Errors ===
    /// The tracker refused to create the issue.
    #[error("Issue creation failed: {message}")]
    Tracker { status: Option<u16>, message: String },

    /// A failure referenced by id does not exist in the triage report.
    #[error("No analyzed failure with test id '{id}'")]
    FailureNotFound { id: String },

    // === Wrapped Errors ===
    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TriageError {
    /// Process exit code for this error.
    ///
    /// Upstream conditions get distinct codes so scripts can tell a rate
    /// limit from a bad token without scraping stderr.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidReport { .. } | Self::Io { .. } => 2,
            Self::MissingSetting { .. } | Self::Settings(_) => 3,
            Self::RateLimited { .. } => 4,
            Self::QuotaExhausted { .. } => 5,
            Self::Unauthorized { .. } => 6,
            Self::Unavailable { .. } | Self::Http(_) => 7,
            Self::Tracker { .. } | Self::FailureNotFound { .. } => 8,
            Self::Upstream { .. } | Self::MalformedResponse { .. } | Self::Json(_) => 1,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_report(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidReport {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TriageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_conditions_have_distinct_exit_codes() {
        let rate = TriageError::RateLimited { body: String::new() };
        let quota = TriageError::QuotaExhausted { body: String::new() };
        let auth = TriageError::Unauthorized {
            service: "OpenAI",
            status: 401,
            body: String::new(),
        };
        let down = TriageError::Unavailable {
            service: "OpenAI",
            reason: "503".to_string(),
        };

        let codes = [
            rate.exit_code(),
            quota.exit_code(),
            auth.exit_code(),
            down.exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn missing_setting_message_names_the_key() {
        let err = TriageError::MissingSetting {
            key: "jira_api_token".to_string(),
        };
        assert!(err.to_string().contains("settings set jira_api_token"));
    }
}
