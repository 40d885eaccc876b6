use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use stager_lib::commands::{journal_commands, pipeline_commands, settings_commands};
use stager_lib::services::classifier_service::LazyClassifier;
use stager_lib::{AppState, Settings};

const DEFAULT_LOG_FILTER: &str = "stager=info,stager_lib=info";

#[derive(Debug, Parser)]
#[command(name = "stager", version, about = "File staged downloads into a library, reversibly")]
struct Cli {
    /// Configuration file (TOML). Defaults to the per-user config file when present.
    #[arg(long, env = "STAGER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Overrides the data directory holding the database and quarantine.
    #[arg(long, env = "STAGER_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Overrides the library root files are filed under.
    #[arg(long, env = "STAGER_LIBRARY", global = true)]
    library: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover files in the staging directories.
    Scan {
        /// Directories to scan instead of the configured ones.
        dirs: Vec<String>,
    },
    /// Classify and file everything discovered so far.
    Process,
    /// Scan, then process.
    Run {
        dirs: Vec<String>,
    },
    /// List files waiting for a decision.
    Reviews,
    /// Decide a file waiting for review. Without options the proposal is accepted.
    Resolve {
        file_id: String,
        /// File under this category instead.
        #[arg(long, conflicts_with = "skip")]
        category: Option<String>,
        #[arg(long)]
        skip: bool,
    },
    /// Show the operation journal, newest first.
    History {
        /// Only operations begun at or after this RFC 3339 time.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Only operations begun at or before this RFC 3339 time.
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        path_prefix: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
    },
    /// Show one operation with its transition log.
    Show { operation_id: String },
    /// Revert an applied operation.
    Undo { operation_id: String },
    /// Re-attempt an operation left pending by a failure.
    Retry { operation_id: String },
    /// Show or change the confidence mode (never, minimal, smart, always).
    Mode { mode: Option<String> },
    /// Show learning statistics.
    Stats {
        /// Recompute them from the full event log first.
        #[arg(long)]
        rebuild: bool,
    },
    /// Suggest known categories starting with a prefix.
    Categories { prefix: Option<String> },
    /// Resolve operations left pending by an earlier crash.
    Recover,
    /// Permanently remove quarantined files past their retention.
    Purge,
    /// Scan and process on the configured interval until interrupted.
    Watch,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render output")?
    );
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(library) = &cli.library {
        settings.library_root = library.clone();
    }
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let state = AppState::open(settings, Arc::new(LazyClassifier::heuristic()))
        .context("failed to open application state")?;

    let recovered = journal_commands::recover(&state).context("startup recovery failed")?;
    if !recovered.journal.applied.is_empty()
        || !recovered.journal.discarded.is_empty()
        || recovered.requeued > 0
        || recovered.interrupted > 0
    {
        tracing::info!(
            applied = recovered.journal.applied.len(),
            discarded = recovered.journal.discarded.len(),
            requeued = recovered.requeued,
            interrupted = recovered.interrupted,
            "recovered from previous run"
        );
    }

    match cli.command {
        Command::Scan { dirs } => print_json(&pipeline_commands::trigger_scan(dirs, &state)?)?,
        Command::Process => print_json(&pipeline_commands::process_staged(&state).await?)?,
        Command::Run { dirs } => {
            pipeline_commands::trigger_scan(dirs, &state)?;
            print_json(&pipeline_commands::process_staged(&state).await?)?;
        }
        Command::Reviews => print_json(&pipeline_commands::pending_reviews(&state)?)?,
        Command::Resolve {
            file_id,
            category,
            skip,
        } => print_json(
            &pipeline_commands::resolve_review(file_id, category, skip, &state).await?,
        )?,
        Command::History {
            since,
            until,
            path_prefix,
            status,
            limit,
            offset,
        } => {
            let request = journal_commands::HistoryRequest {
                since,
                until,
                path_prefix,
                status,
                limit,
                offset,
            };
            print_json(&journal_commands::operation_history(request, &state)?)?;
        }
        Command::Show { operation_id } => {
            let operation = journal_commands::get_operation(operation_id.clone(), &state)?;
            let transitions = journal_commands::operation_transitions(operation_id, &state)?;
            print_json(&serde_json::json!({
                "operation": operation,
                "transitions": transitions,
            }))?;
        }
        Command::Undo { operation_id } => {
            print_json(&journal_commands::undo_operation(operation_id, &state)?)?
        }
        Command::Retry { operation_id } => {
            print_json(&journal_commands::retry_operation(operation_id, &state)?)?
        }
        Command::Mode { mode: None } => {
            print_json(&settings_commands::get_confidence_mode(&state)?)?
        }
        Command::Mode { mode: Some(mode) } => {
            print_json(&settings_commands::set_confidence_mode(mode, &state)?)?
        }
        Command::Stats { rebuild } => {
            let stats = if rebuild {
                settings_commands::rebuild_learning_stats(&state)?
            } else {
                settings_commands::learning_stats(&state)?
            };
            print_json(&stats)?;
        }
        Command::Categories { prefix } => {
            print_json(&pipeline_commands::category_hints(prefix, &state)?)?
        }
        Command::Recover => print_json(&recovered)?,
        Command::Purge => print_json(&journal_commands::purge_expired(&state)?)?,
        Command::Watch => {
            tracing::info!(
                interval_secs = state.settings.scan_interval().as_secs(),
                dirs = state.settings.staging_dirs.len(),
                "watching staging directories"
            );
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "could not listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            };
            state.orchestrator.clone().run_scheduled(shutdown).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_accepts_a_time_range() {
        let cli = Cli::try_parse_from([
            "stager",
            "history",
            "--since",
            "2024-03-01T00:00:00Z",
            "--until",
            "2024-03-31T23:59:59Z",
            "--status",
            "applied",
        ])
        .unwrap();
        let Command::History { since, until, status, .. } = cli.command else {
            panic!("expected history, got {:?}", cli.command);
        };
        assert_eq!(since.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(until.unwrap().to_rfc3339(), "2024-03-31T23:59:59+00:00");
        assert_eq!(status.as_deref(), Some("applied"));
    }

    #[test]
    fn history_rejects_a_malformed_time() {
        assert!(Cli::try_parse_from(["stager", "history", "--since", "last week"]).is_err());
    }
}
