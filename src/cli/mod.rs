//! Command-line surface.
//!
//! Exit codes: 0 success, 1 system error, 2 user error, 3 authorization
//! error, 130 on interrupt (a resumable batch ID is printed first).

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Receipt processing and CRA expense categorization
#[derive(Parser)]
#[command(name = "expense-ops", version, about)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "expense-ops.toml")]
    pub config: PathBuf,

    /// Verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Authorize against QuickBooks and persist tokens
    Auth {
        /// Discard existing tokens and re-authorize
        #[arg(long)]
        force: bool,
    },

    /// Report token validity and connectivity
    Status,

    /// Process one receipt
    Upload(UploadArgs),

    /// Process a directory of receipts
    Batch(BatchArgs),

    /// Run the HTTP API server
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Parser)]
pub struct UploadArgs {
    /// Receipt file (image or PDF)
    pub file: PathBuf,

    /// Run all stages but skip the accounting write
    #[arg(long)]
    pub dry_run: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Extra context passed to the extraction stage
    #[arg(long)]
    pub context: Option<String>,

    /// Use the deterministic rule-engine pathway instead of the LLM pathway
    #[arg(long)]
    pub rules: bool,
}

#[derive(Parser)]
pub struct BatchArgs {
    /// Directory of receipt files
    pub dir: PathBuf,

    /// Recurse into subdirectories
    #[arg(long, short)]
    pub recursive: bool,

    /// Glob pattern on file names, e.g. "2024-*.pdf"
    #[arg(long)]
    pub pattern: Option<String>,

    /// Run all stages but skip accounting writes
    #[arg(long)]
    pub dry_run: bool,

    /// Receipts processed concurrently
    #[arg(long, default_value_t = 1)]
    pub parallel: usize,

    /// Resume a previous batch by its identifier
    #[arg(long)]
    pub resume: Option<String>,

    /// Stop at the first failed file
    #[arg(long)]
    pub fail_fast: bool,

    /// Use the deterministic rule-engine pathway instead of the LLM pathway
    #[arg(long)]
    pub rules: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_args_parse() {
        let cli = Cli::parse_from([
            "expense-ops",
            "upload",
            "receipt.jpg",
            "--dry-run",
            "--output",
            "json",
        ]);
        match cli.command {
            Commands::Upload(args) => {
                assert_eq!(args.file, PathBuf::from("receipt.jpg"));
                assert!(args.dry_run);
                assert_eq!(args.output, OutputFormat::Json);
                assert!(!args.rules);
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_batch_args_defaults() {
        let cli = Cli::parse_from(["expense-ops", "batch", "receipts/"]);
        match cli.command {
            Commands::Batch(args) => {
                assert_eq!(args.parallel, 1);
                assert!(!args.recursive);
                assert!(args.resume.is_none());
            }
            _ => panic!("expected batch"),
        }
    }

    #[test]
    fn test_auth_force_flag() {
        let cli = Cli::parse_from(["expense-ops", "auth", "--force"]);
        assert!(matches!(cli.command, Commands::Auth { force: true }));
    }
}
