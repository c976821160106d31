//! Inspect and drive waypoint checkpoints and context snapshots.
//!
//! # Examples
//!
//! ```sh
//! # Snapshot a working directory for a task
//! waypoint commit --dir ~/src/project --task task-42
//!
//! # List checkpoints, oldest first
//! waypoint list --dir ~/src/project --task task-42
//!
//! # What changed since a checkpoint
//! waypoint diff --dir ~/src/project --task task-42 --from 1a2b3c4d
//! waypoint diff --dir ~/src/project --task task-42 --from 1a2b3c4d --stat
//!
//! # Roll back
//! waypoint restore --dir ~/src/project --task task-42 1a2b3c4d
//!
//! # Patterns that are never snapshotted
//! waypoint exclusions --dir ~/src/project
//!
//! # Audit a persisted context overlay
//! waypoint overlay ~/.local/share/waypoint/context/task-42/context.json
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `waypoint=info`).

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use waypoint::checkpoint::{CheckpointTracker, ExclusionRuleSet};
use waypoint::config::WaypointConfig;
use waypoint::context::ContextSnapshot;

/// Shadow-git checkpoints and context overlays for coding agents.
#[derive(Parser)]
#[command(name = "waypoint", version)]
struct Cli {
    /// JSON config file (missing fields take their defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the checkpoint storage root
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Working directory and task a checkpoint command operates on.
#[derive(clap::Args)]
struct Target {
    /// Working directory being checkpointed
    #[arg(long)]
    dir: PathBuf,

    /// Task id
    #[arg(long)]
    task: String,
}

#[derive(Subcommand)]
enum Command {
    /// Snapshot the working directory and print the new hash
    Commit(Target),

    /// List checkpoints, oldest first
    List(Target),

    /// Show a unified diff between snapshots or against the working tree
    Diff {
        #[command(flatten)]
        target: Target,

        /// Base checkpoint (default: HEAD)
        #[arg(long)]
        from: Option<String>,

        /// Other checkpoint (default: the working tree)
        #[arg(long)]
        to: Option<String>,

        /// Print changed paths only
        #[arg(long)]
        stat: bool,
    },

    /// Restore the working directory to a checkpoint
    Restore {
        #[command(flatten)]
        target: Target,

        /// Checkpoint hash
        hash: String,
    },

    /// Print the exclusion patterns for a directory
    Exclusions {
        /// Working directory
        #[arg(long)]
        dir: PathBuf,
    },

    /// Print the update history stored in a context snapshot file
    Overlay {
        /// Path to a `context.json` snapshot
        file: PathBuf,
    },
}

type CliResult = Result<String, Box<dyn std::error::Error>>;

fn load_config(cli: &Cli) -> Result<WaypointConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => WaypointConfig::from_json_file(path)?,
        None => WaypointConfig::default(),
    };
    if let Some(root) = &cli.storage_root {
        config.checkpoint.storage_root = root.clone();
    }
    Ok(config)
}

async fn open(target: &Target, config: &WaypointConfig) -> Result<CheckpointTracker, Box<dyn std::error::Error>> {
    Ok(CheckpointTracker::open(&target.dir, target.task.clone(), config.checkpoint.clone()).await?)
}

fn format_time(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

async fn run(cli: &Cli) -> CliResult {
    let config = load_config(cli)?;

    match &cli.command {
        Command::Commit(target) => {
            let tracker = open(target, &config).await?;
            Ok(format!("{}\n", tracker.commit().await?))
        }
        Command::List(target) => {
            let tracker = open(target, &config).await?;
            let mut out = String::new();
            for cp in tracker.list_checkpoints().await {
                out.push_str(&format!(
                    "{}  {}  {}\n",
                    cp.commit_hash,
                    format_time(cp.timestamp),
                    cp.state
                ));
            }
            Ok(out)
        }
        Command::Diff {
            target,
            from,
            to,
            stat,
        } => {
            let tracker = open(target, &config).await?;
            if *stat {
                let mut out = String::new();
                for file in tracker.changed_files(from.as_deref(), to.as_deref()).await? {
                    out.push_str(&format!("{}\t{}\n", file.kind.code(), file.path));
                }
                Ok(out)
            } else {
                Ok(tracker.diff(from.as_deref(), to.as_deref()).await?)
            }
        }
        Command::Restore { target, hash } => {
            let tracker = open(target, &config).await?;
            tracker.restore(hash).await?;
            Ok(format!("restored {} to {hash}\n", tracker.work_dir().display()))
        }
        Command::Exclusions { dir } => {
            let dir = std::fs::canonicalize(dir)?;
            let rules = ExclusionRuleSet::compute_for_directory(&dir, &config.checkpoint);
            Ok(rules.patterns().iter().map(|p| format!("{p}\n")).collect())
        }
        Command::Overlay { file } => {
            let json = std::fs::read_to_string(file)?;
            let snapshot: ContextSnapshot = serde_json::from_str(&json)?;
            let state = &snapshot.state;

            let mut out = format!("saved at {}\n", format_time(snapshot.saved_at));
            match state.range {
                Some(range) => out.push_str(&format!("truncated: {range}\n")),
                None => out.push_str("truncated: none\n"),
            }
            for (message, block, updates) in state.overlay.iter() {
                out.push_str(&format!("message {message}, block {block}:\n"));
                for update in updates {
                    out.push_str(&format!(
                        "  {}  {:?}  {}\n",
                        format_time(update.timestamp),
                        update.update_type,
                        update.value.lines().next().unwrap_or_default()
                    ));
                }
            }
            Ok(out)
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waypoint=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match run(&cli).await {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
