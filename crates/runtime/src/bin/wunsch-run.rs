//! Batch runner: load a want config, reconcile until every want reaches a
//! terminal status, write the final snapshot, exit.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use wunsch_runtime::{load_config, load_snapshot, Builder};
use wunsch_runtime::builder::BuilderOptions;

#[derive(Parser, Debug)]
#[command(name = "wunsch-run", about = "Run a want config to completion")]
struct Args {
    /// Want config file (wants list or top-level recipe reference).
    #[arg(long, env = "WUNSCH_CONFIG")]
    config: PathBuf,

    /// Directory of per-type want definitions.
    #[arg(long, env = "WUNSCH_TYPES_DIR")]
    types_dir: Option<PathBuf>,

    /// Directory of agent capability files.
    #[arg(long, env = "WUNSCH_CAPABILITIES_DIR")]
    capabilities_dir: Option<PathBuf>,

    /// Directory for periodic memory snapshots.
    #[arg(long, env = "WUNSCH_MEMORY_DIR")]
    memory_dir: Option<PathBuf>,

    /// Global state persistence file.
    #[arg(long)]
    global_state: Option<PathBuf>,

    /// Seed the run from a previous memory snapshot instead of the config.
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Reload the config when its content changes.
    #[arg(long)]
    watch: bool,

    /// Give up if the run has not settled after this many seconds.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let wants = match &args.restore {
        Some(snapshot_path) => load_snapshot(snapshot_path)
            .with_context(|| format!("restoring from {}", snapshot_path.display()))?
            .into_configs(),
        None => load_config(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?,
    };
    info!(wants = wants.len(), "config loaded");

    let builder = Builder::new(BuilderOptions {
        memory_dir: args.memory_dir,
        types_dir: args.types_dir,
        capabilities_dir: args.capabilities_dir,
        global_state_file: args.global_state,
        watch_config: args.watch.then(|| args.config.clone()),
    });
    let reconcile_task = builder.start();

    // in watch mode the reconciler loads the config itself on its first
    // tick; queueing the same wants here would collide on names
    if !args.watch {
        builder
            .queue_want_add(wants)
            .await
            .context("submitting wants")?;
    }

    tokio::select! {
        result = builder.run_until_settled(Duration::from_secs(args.timeout_secs)) => {
            match result {
                Ok(summary) => info!(
                    total = summary.total,
                    achieved = summary.achieved,
                    failed = summary.failed,
                    "run settled"
                ),
                Err(err) => warn!(error = %err, "run did not settle"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    builder.shutdown().await;
    reconcile_task.abort();
    Ok(())
}
