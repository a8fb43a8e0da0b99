use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Parse Extent HTML test reports, triage failures and file defects.
#[derive(Parser, Debug)]
#[command(name = "report-triage", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract test cases from a report
    Parse {
        /// Path to the .html/.htm report
        file: PathBuf,

        /// Print the parsed report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse a report and classify its failures
    Analyze {
        /// Path to the .html/.htm report
        file: PathBuf,

        /// Write the triage report (JSON) to this path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the triage report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create Jira issues from a saved triage report
    Export {
        /// Triage report written by `analyze --output`
        triage: PathBuf,

        /// Failures to export (defaults to every application defect)
        #[arg(long = "test-id")]
        test_ids: Vec<String>,

        /// Print the issue drafts instead of creating them
        #[arg(long)]
        dry_run: bool,
    },

    /// Read and write persistent settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Store a value
    Set { key: String, value: String },
    /// Print a stored value
    Get { key: String },
    /// Remove a stored value
    Unset { key: String },
    /// List every known setting (secrets masked)
    Show,
}
