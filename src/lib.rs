// Module declarations
pub mod analysis;
pub mod cli;
pub mod dashboard;
pub mod error;
pub mod jira;
pub mod logging;
pub mod model;
pub mod parser;
pub mod report_checker;
pub mod settings;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser as _;
use tracing::{info, warn};

// Re-export commonly used types
pub use analysis::{AnalysisResult, DefectCategory, FailureAnalysis, TriageReport};
pub use error::{Result, TriageError};
pub use jira::{CreatedIssue, ExportOutcome, IssueDraft};
pub use model::{ParsedReport, RunSummary, Screenshot, TestCase, TestStatus};
pub use parser::parse_report;
pub use report_checker::ReportFile;
pub use settings::SettingsStore;

use cli::{Cli, Commands, SettingsCommand};

// Command entry points - Parsing
pub fn parse_report_file(path: impl AsRef<Path>) -> Result<(ReportFile, ParsedReport)> {
    let file = report_checker::validate_report_file(path)?;
    let parsed = parser::parse_report(&file.content);
    Ok((file, parsed))
}

// Command entry points - Analysis
pub async fn analyze_report_file(path: impl AsRef<Path>, store: &SettingsStore) -> Result<TriageReport> {
    let ai = analysis::AiSettings::load(store)?;
    let (file, parsed) = parse_report_file(path)?;
    let result = analysis::request_analysis(&ai, &parsed).await?;
    Ok(TriageReport::new(file.name, parsed, result))
}

// Command entry points - Issue export
pub fn draft_issues(report: &TriageReport, test_ids: &[String]) -> Result<Vec<IssueDraft>> {
    Ok(jira::select_failures(report, test_ids)?
        .into_iter()
        .map(|(tc, failure)| IssueDraft::from_failure(tc, failure))
        .collect())
}

/// Credentials are checked before the first issue is created. A draft that
/// fails does not stop the drafts after it.
pub async fn export_issues(store: &SettingsStore, drafts: &[IssueDraft]) -> Result<ExportOutcome> {
    let creds = jira::JiraCredentials::load(store)?;
    let mut outcome = ExportOutcome::default();
    for draft in drafts {
        match jira::create_issue(&creds, draft).await {
            Ok(issue) => outcome.created.push(issue),
            Err(e) => {
                warn!(test = %draft.test_id, error = %e, "issue creation failed");
                outcome.failed.push((draft.test_id.clone(), e));
            }
        }
    }
    info!(
        created = outcome.created.len(),
        failed = outcome.failed.len(),
        "export finished"
    );
    Ok(outcome)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn dispatch(command: Commands, store: &SettingsStore) -> Result<()> {
    match command {
        Commands::Parse { file, json } => {
            let (file, parsed) = parse_report_file(&file)?;
            if json {
                return print_json(&parsed);
            }
            print!("{}", dashboard::render_summary(&file.name, &parsed.summary));
            if parsed.tier == model::ExtractionTier::RegexFallback {
                println!("  No test structure found; records were synthesized from summary counts.");
            }
            print!("{}", dashboard::render_test_cases(&parsed.test_cases));
            Ok(())
        }
        Commands::Analyze { file, output, json } => {
            let triage = analyze_report_file(&file, store).await?;
            if let Some(path) = &output {
                report_checker::write_triage_report(path, &triage)?;
            }
            if json {
                return print_json(&triage);
            }
            print!("{}", dashboard::render_summary(&triage.report_name, &triage.summary));
            print!("{}", dashboard::render_test_cases(&triage.test_cases));
            print!("{}", dashboard::render_analysis(&triage.analysis));
            if let Some(path) = output {
                println!("\nTriage report written to {}", path.display());
            }
            Ok(())
        }
        Commands::Export {
            triage,
            test_ids,
            dry_run,
        } => {
            let report = report_checker::read_triage_report(&triage)?;
            let drafts = draft_issues(&report, &test_ids)?;
            if drafts.is_empty() {
                println!("No failures selected for export.");
                return Ok(());
            }
            if dry_run {
                return print_json(&drafts);
            }
            let outcome = export_issues(store, &drafts).await?;
            for issue in &outcome.created {
                println!("{} {}", issue.key, issue.url);
                if issue.attachments_uploaded > 0 {
                    println!("  {} attachment(s) uploaded", issue.attachments_uploaded);
                }
                for failure in &issue.attachment_failures {
                    println!("  attachment failed: {}", failure);
                }
            }
            for (test_id, e) in &outcome.failed {
                eprintln!("{} not exported: {}", test_id, e);
            }
            match outcome.failed.into_iter().next() {
                Some((_, first)) => Err(first),
                None => Ok(()),
            }
        }
        Commands::Settings { command } => run_settings(command, store),
    }
}

fn run_settings(command: SettingsCommand, store: &SettingsStore) -> Result<()> {
    let known = |key: &str| settings::KNOWN_SETTINGS.iter().any(|(k, _)| *k == key);
    match command {
        SettingsCommand::Set { key, value } => {
            if !known(&key) {
                warn!(key = %key, "storing a setting the application does not read");
            }
            store.save(&key, &value)?;
            info!(key = %key, "setting saved");
            Ok(())
        }
        SettingsCommand::Get { key } => {
            match store.resolve(&key)? {
                Some(value) => println!("{}", value),
                None => println!("(not set)"),
            }
            Ok(())
        }
        SettingsCommand::Unset { key } => {
            if !store.remove(&key)? {
                println!("{} was not set", key);
            }
            Ok(())
        }
        SettingsCommand::Show => {
            println!("{}", store.describe()?);
            Ok(())
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.verbose) {
        eprintln!("{}", e);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = SettingsStore::open_default();
    match runtime.block_on(dispatch(cli.command, &store)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_commands_read_and_write_the_given_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("settings.json"));
        let set = SettingsCommand::Set {
            key: settings::JIRA_PROJECT_KEY.to_string(),
            value: "QA".to_string(),
        };
        run_settings(set, &store).unwrap();
        assert_eq!(store.load(settings::JIRA_PROJECT_KEY).unwrap(), "QA");
        run_settings(SettingsCommand::Show, &store).unwrap();

        let unset = SettingsCommand::Unset {
            key: settings::JIRA_PROJECT_KEY.to_string(),
        };
        run_settings(unset, &store).unwrap();
        assert_eq!(store.load(settings::JIRA_PROJECT_KEY).unwrap(), "");
    }
}
