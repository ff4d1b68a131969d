//! `dozlab`: create, inspect and delete lab sessions from the command line.
//!
//! Talks to the cluster through the current kubeconfig context. Sessions are
//! plain `LabSession` objects; the operator does the rest.

mod commands;
mod error;
mod output;

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dozlab_operator::LabSession;
use kube::{Api, Client};
use tracing::Level;

use crate::error::{format_kube_error, UsageError, EXIT_ERROR, EXIT_USAGE};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "dozlab")]
#[command(about = "Manage Dozlab lab sessions", long_about = None)]
pub struct Cli {
    /// Namespace holding the sessions
    #[arg(short, long, global = true, default_value = "default")]
    pub namespace: String,

    /// Output format
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a lab session
    Create(CreateArgs),
    /// Delete a lab session and everything it owns
    Delete {
        #[arg(long)]
        session_id: String,
    },
    /// List lab sessions
    List,
    /// Show the phase and children of a session
    Status {
        #[arg(long)]
        session_id: String,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub session_id: String,
    #[arg(long)]
    pub user_id: String,
    /// URL of the ext4 root filesystem image
    #[arg(long)]
    pub rootfs_url: String,
    /// Expected SHA-256 of the root filesystem image
    #[arg(long)]
    pub rootfs_sha256: Option<String>,
    #[arg(long, default_value = "2Gi")]
    pub memory: String,
    #[arg(long, default_value = "1")]
    pub cpu: String,
    #[arg(long, default_value = "4Gi")]
    pub storage: String,
    /// Time-to-live, e.g. 30m or 1h30m
    #[arg(long, default_value = "30m")]
    pub timeout: String,
    /// IDE password (generated when omitted)
    #[arg(long)]
    pub password: Option<String>,
    #[arg(long)]
    pub no_terminal: bool,
    #[arg(long)]
    pub no_vscode: bool,
    #[arg(long)]
    pub no_ssh: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Connection error: {}", e);
            return ExitCode::from(EXIT_ERROR);
        }
    };
    let api: Api<LabSession> = Api::namespaced(client, &cli.namespace);

    match commands::handle(api, &cli.namespace, cli.command, cli.format).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(usage) = e.downcast_ref::<UsageError>() {
                eprintln!("Error: {}", usage);
                ExitCode::from(EXIT_USAGE)
            } else if let Some(kube_err) = e.downcast_ref::<kube::Error>() {
                eprintln!("{}", format_kube_error(kube_err));
                ExitCode::from(EXIT_ERROR)
            } else {
                eprintln!("Error: {}", e);
                ExitCode::from(EXIT_ERROR)
            }
        }
    }
}
