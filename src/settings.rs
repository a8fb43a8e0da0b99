use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Result, TriageError};

pub const OPENAI_API_KEY: &str = "openai_api_key";
pub const OPENAI_MODEL: &str = "openai_model";
pub const OPENAI_ENDPOINT: &str = "openai_endpoint";
pub const JIRA_BASE_URL: &str = "jira_base_url";
pub const JIRA_EMAIL: &str = "jira_email";
pub const JIRA_API_TOKEN: &str = "jira_api_token";
pub const JIRA_PROJECT_KEY: &str = "jira_project_key";

/// Every key the application reads, with the environment variable that
/// overrides it.
pub const KNOWN_SETTINGS: &[(&str, &str)] = &[
    (OPENAI_API_KEY, "OPENAI_API_KEY"),
    (OPENAI_MODEL, "REPORT_TRIAGE_OPENAI_MODEL"),
    (OPENAI_ENDPOINT, "REPORT_TRIAGE_OPENAI_ENDPOINT"),
    (JIRA_BASE_URL, "JIRA_BASE_URL"),
    (JIRA_EMAIL, "JIRA_EMAIL"),
    (JIRA_API_TOKEN, "JIRA_API_TOKEN"),
    (JIRA_PROJECT_KEY, "JIRA_PROJECT_KEY"),
];

const SECRET_KEYS: &[&str] = &[OPENAI_API_KEY, JIRA_API_TOKEN];

pub fn settings_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("REPORT_TRIAGE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let mut home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.push(".report-triage");
    home
}

pub fn settings_path() -> PathBuf {
    settings_dir().join("settings.json")
}

fn env_override(key: &str) -> Option<String> {
    KNOWN_SETTINGS
        .iter()
        .find(|(k, _)| *k == key)
        .and_then(|(_, var)| std::env::var(var).ok())
        .filter(|v| !v.trim().is_empty())
}

fn mask(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    if value.chars().count() <= 8 {
        "********".to_string()
    } else {
        format!("{}********", visible)
    }
}

/// Flat key/value settings stored as a JSON object.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open_default() -> Self {
        Self::at(settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| TriageError::io(&self.path, e))?;
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(TriageError::Settings(format!(
                "{} does not contain a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(TriageError::Settings(format!(
                "Failed to parse settings: {}",
                e
            ))),
        }
    }

    fn write_all(&self, settings: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| TriageError::io(parent, e))?;
            }
        }
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, content).map_err(|e| TriageError::io(&self.path, e))
    }

    pub fn save(&self, key: &str, value: &str) -> Result<()> {
        // A corrupt file is replaced rather than blocking every later save.
        let mut settings = self.read_all().unwrap_or_default();
        settings.insert(key.to_string(), Value::String(value.to_string()));
        self.write_all(&settings)?;
        debug!(key, path = %self.path.display(), "saved setting");
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut settings = self.read_all()?;
        let removed = settings.remove(key).is_some();
        if removed {
            self.write_all(&settings)?;
        }
        Ok(removed)
    }

    /// Stored value for `key`, or an empty string when absent.
    pub fn load(&self, key: &str) -> Result<String> {
        let settings = self.read_all()?;
        Ok(settings
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string())
    }

    /// Effective value: environment override first, then the file.
    pub fn resolve(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = env_override(key) {
            return Ok(Some(value));
        }
        let value = self.load(key)?;
        Ok(if value.trim().is_empty() {
            None
        } else {
            Some(value)
        })
    }

    /// Like [`resolve`](Self::resolve) but a missing value is an error.
    pub fn require(&self, key: &str) -> Result<String> {
        self.resolve(key)?.ok_or_else(|| TriageError::MissingSetting {
            key: key.to_string(),
        })
    }

    /// Human-readable dump with secrets masked.
    pub fn describe(&self) -> Result<String> {
        let settings = self.read_all()?;
        let mut lines = vec![format!("Settings file path: {}", self.path.display())];
        if !self.path.exists() {
            lines.push("Settings file does not exist".to_string());
        }
        for (key, var) in KNOWN_SETTINGS {
            let stored = settings.get(*key).and_then(|v| v.as_str()).unwrap_or("");
            let (value, origin) = match env_override(key) {
                Some(v) => (v, format!("env {}", var)),
                None if !stored.is_empty() => (stored.to_string(), "file".to_string()),
                None => {
                    lines.push(format!("  {:<18} (not set)", key));
                    continue;
                }
            };
            let shown = if SECRET_KEYS.contains(key) {
                mask(&value)
            } else {
                value
            };
            lines.push(format!("  {:<18} {} [{}]", key, shown, origin));
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::at(dir.path().join("nested").join("settings.json"));
        (dir, store)
    }

    #[test]
    fn save_then_load_round_trips_and_creates_parent() {
        let (_dir, store) = temp_store();
        store.save(JIRA_PROJECT_KEY, "QA").unwrap();
        assert_eq!(store.load(JIRA_PROJECT_KEY).unwrap(), "QA");
        assert!(store.path().exists());
    }

    #[test]
    fn missing_file_loads_empty() {
        let (_dir, store) = temp_store();
        assert_eq!(store.load(JIRA_EMAIL).unwrap(), "");
    }

    #[test]
    fn require_reports_missing_key() {
        let (_dir, store) = temp_store();
        let err = store.require("jira_unused_key").unwrap_err();
        assert!(matches!(err, TriageError::MissingSetting { key } if key == "jira_unused_key"));
    }

    #[test]
    fn corrupt_file_is_a_settings_error_but_save_recovers() {
        let (_dir, store) = temp_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "not json").unwrap();
        assert!(matches!(store.load(JIRA_EMAIL), Err(TriageError::Settings(_))));
        store.save(JIRA_EMAIL, "qa@example.com").unwrap();
        assert_eq!(store.load(JIRA_EMAIL).unwrap(), "qa@example.com");
    }

    #[test]
    fn remove_deletes_only_that_key() {
        let (_dir, store) = temp_store();
        store.save(JIRA_EMAIL, "a@b.c").unwrap();
        store.save(JIRA_PROJECT_KEY, "QA").unwrap();
        assert!(store.remove(JIRA_EMAIL).unwrap());
        assert!(!store.remove(JIRA_EMAIL).unwrap());
        assert_eq!(store.load(JIRA_PROJECT_KEY).unwrap(), "QA");
    }

    #[test]
    fn describe_masks_secrets_and_lists_unset_keys() {
        if std::env::var("JIRA_API_TOKEN").is_ok() || std::env::var("JIRA_EMAIL").is_ok() {
            return;
        }
        let (_dir, store) = temp_store();
        store.save(JIRA_API_TOKEN, "abcd-secret-token").unwrap();
        let text = store.describe().unwrap();
        assert!(text.contains("abcd********"));
        assert!(!text.contains("secret-token"));
        assert!(text.contains(&format!("  {:<18} (not set)", JIRA_EMAIL)));
    }

    #[test]
    fn mask_hides_most_of_the_secret() {
        assert_eq!(mask("short"), "********");
        assert_eq!(mask("sk-abcdefghijkl"), "sk-a********");
    }
}
