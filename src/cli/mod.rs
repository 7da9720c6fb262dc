pub mod config;

pub use config::JobflowConfig;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use crate::engine::registry::Pid;
use crate::storage::json_store::JsonCheckpointStore;
use crate::storage::{Checkpoint, CheckpointArea, CheckpointStore};

#[derive(Parser)]
#[command(
    name = "jobflow",
    version,
    about = "Inspect and configure the jobflow process engine"
)]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to the config file (default: auto-detect jobflow.yaml in cwd)
    #[arg(long, global = true, env = "JOBFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List stored checkpoints
    Checkpoints {
        /// Only list this area (default: all areas)
        #[arg(short, long, value_enum)]
        area: Option<CheckpointArea>,

        /// Checkpoint store directory (default: from config)
        #[arg(long, env = "JOBFLOW_CHECKPOINT_DIR")]
        store_dir: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Print one checkpoint as JSON
    Inspect {
        /// Process id
        pid: u64,

        /// Area to look in (default: search all areas)
        #[arg(short, long, value_enum)]
        area: Option<CheckpointArea>,

        /// Checkpoint store directory (default: from config)
        #[arg(long, env = "JOBFLOW_CHECKPOINT_DIR")]
        store_dir: Option<PathBuf>,
    },

    /// Print the effective engine configuration
    Config,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = JobflowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Checkpoints {
            area,
            store_dir,
            format,
        } => {
            let dir = store_dir.unwrap_or_else(|| config.checkpoint_dir());
            cmd_checkpoints(area, &dir, format).await
        }
        Commands::Inspect {
            pid,
            area,
            store_dir,
        } => {
            let dir = store_dir.unwrap_or_else(|| config.checkpoint_dir());
            cmd_inspect(Pid(pid), area, &dir).await
        }
        Commands::Config => cmd_config(config),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (warn if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

#[derive(Serialize)]
struct CheckpointRow<'a> {
    area: CheckpointArea,
    #[serde(flatten)]
    checkpoint: &'a Checkpoint,
}

async fn cmd_checkpoints(
    area: Option<CheckpointArea>,
    store_dir: &Path,
    format: OutputFormat,
) -> Result<()> {
    let store = JsonCheckpointStore::new(store_dir);
    let areas = match area {
        Some(a) => vec![a],
        None => CheckpointArea::ALL.to_vec(),
    };

    let mut found: Vec<(CheckpointArea, Checkpoint)> = Vec::new();
    for area in areas {
        for checkpoint in store.load_all(area).await? {
            found.push((area, checkpoint));
        }
    }

    if found.is_empty() {
        println!("No checkpoints found.");
        return Ok(());
    }

    if format == OutputFormat::Json {
        let rows: Vec<CheckpointRow> = found
            .iter()
            .map(|(area, checkpoint)| CheckpointRow {
                area: *area,
                checkpoint,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<10} {:<10} {:<24} {:<24} {:<20}",
        "PID", "AREA", "SPEC", "STATE", "SAVED"
    );
    println!("{}", "-".repeat(92));

    for (area, checkpoint) in &found {
        println!(
            "{:<10} {:<10} {:<24} {:<24} {:<20}",
            checkpoint.pid,
            area,
            checkpoint.spec,
            describe_state(checkpoint),
            checkpoint.saved.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} checkpoint(s)", found.len());
    Ok(())
}

fn describe_state(checkpoint: &Checkpoint) -> String {
    use crate::engine::state_machine::ProcessState;
    match &checkpoint.state {
        ProcessState::Waiting { command, .. } => format!("waiting ({})", command),
        state => state.label().to_string(),
    }
}

async fn cmd_inspect(pid: Pid, area: Option<CheckpointArea>, store_dir: &Path) -> Result<()> {
    let store = JsonCheckpointStore::new(store_dir);
    let areas = match area {
        Some(a) => vec![a],
        None => CheckpointArea::ALL.to_vec(),
    };

    for area in areas {
        if let Some(checkpoint) = store.load(area, pid).await? {
            println!("Area: {}", area);
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            return Ok(());
        }
    }

    Err(anyhow::anyhow!("No checkpoint for process {}", pid))
        .with_context(|| format!("Searched {}", store_dir.display()))
}

fn cmd_config(config: JobflowConfig) -> Result<()> {
    let checkpoint_dir = config.checkpoint_dir();
    let engine = config.into_engine_config();

    println!("checkpoint_dir:      {}", checkpoint_dir.display());
    println!("work_dir:            {}", engine.work_dir.display());
    println!("poll_interval:       {}s", engine.poll_interval.as_secs());
    println!("transport_idle:      {}s", engine.transport_idle.as_secs());
    println!("default_user:        {}", engine.default_user);
    println!("archive_checkpoints: {}", engine.archive_checkpoints);
    Ok(())
}
