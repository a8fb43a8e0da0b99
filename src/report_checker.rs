use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::analysis::TriageReport;
use crate::error::{Result, TriageError};

pub const MAX_REPORT_BYTES: u64 = 50 * 1024 * 1024;
const ACCEPTED_EXTENSIONS: &[&str] = &["html", "htm"];

/// A report file that passed intake and has been decoded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(skip)]
    pub content: String,
}

pub fn validate_report_file(path: impl AsRef<Path>) -> Result<ReportFile> {
    let path = path.as_ref();

    // Rule 1: only HTML exports are accepted
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if !ACCEPTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(TriageError::invalid_report(
            path,
            "expected an .html or .htm report",
        ));
    }

    // Rule 2: the file has to exist and be a regular file
    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TriageError::invalid_report(path, "file does not exist"),
        _ => TriageError::io(path, e),
    })?;
    if !metadata.is_file() {
        return Err(TriageError::invalid_report(path, "not a regular file"));
    }

    // Rule 3: size limit
    if metadata.len() > MAX_REPORT_BYTES {
        return Err(TriageError::invalid_report(
            path,
            format!(
                "file is {} bytes, the limit is {} bytes",
                metadata.len(),
                MAX_REPORT_BYTES
            ),
        ));
    }

    let bytes = fs::read(path).map_err(|e| TriageError::io(path, e))?;
    let content = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            debug!(path = %path.display(), "report is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    info!(name = %name, bytes = metadata.len(), "report accepted");

    Ok(ReportFile {
        name,
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        content,
    })
}

pub fn read_triage_report(path: impl AsRef<Path>) -> Result<TriageReport> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|e| TriageError::io(path, e))?;
    Ok(serde_json::from_str(&data)?)
}

pub fn write_triage_report(path: impl AsRef<Path>, report: &TriageReport) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| TriageError::io(parent, e))?;
    }
    let content = serde_json::to_string_pretty(report)?;
    fs::write(path, content).map_err(|e| TriageError::io(path, e))?;
    info!(path = %path.display(), "triage report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_html_regardless_of_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Run.HTM");
        fs::write(&path, "<html><body>ok</body></html>").unwrap();
        let file = validate_report_file(&path).unwrap();
        assert_eq!(file.name, "Run.HTM");
        assert!(file.content.contains("ok"));
    }

    #[test]
    fn rejects_other_extensions_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("report.txt");
        fs::write(&txt, "x").unwrap();
        assert!(matches!(
            validate_report_file(&txt),
            Err(TriageError::InvalidReport { .. })
        ));
        assert!(matches!(
            validate_report_file(dir.path().join("absent.html")),
            Err(TriageError::InvalidReport { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.html");
        fs::write(&path, [b'<', b'p', b'>', 0xff, b'<', b'/', b'p', b'>']).unwrap();
        let file = validate_report_file(&path).unwrap();
        assert!(file.content.contains('\u{FFFD}'));
    }
}
