// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `inventory-syncd`: runs the import on a schedule, once, or reports stale items.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use inventory_sync::{
    AppContext, InventorySyncConfig, LogFormat, SyncEngine, SyncOutcome, SyncScheduler,
};

#[derive(Parser, Debug)]
#[command(name = "inventory-syncd", version, about = "Inventory sync daemon")]
struct Cli {
    /// TOML config file; INVENTORY_SYNC_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless INVENTORY_SYNC_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Run a single sync and exit
    SyncOnce,
    /// List items not synced within the staleness window
    Stale,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("inventory-syncd error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = InventorySyncConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(config.log_format, cli.verbose)?;

    let ctx = AppContext::connect(config)
        .await
        .context("failed to connect backends")?;
    let source = ctx.source_reader().await.context("failed to open source")?;
    let engine = Arc::new(SyncEngine::new(&ctx, source));

    match cli.command {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let scheduler = SyncScheduler::new(engine, ctx.config.sync_interval());
            let handle = scheduler.spawn(shutdown_rx);

            tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);

            let runs = handle.await.context("scheduler task panicked")?;
            info!(runs, "Stopped");
        }
        Command::SyncOnce => match engine.run_sync().await? {
            SyncOutcome::Completed(result) => {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            SyncOutcome::Skipped { holder_id } => {
                warn!(holder = ?holder_id, "Sync skipped: lease held elsewhere");
            }
        },
        Command::Stale => {
            for item in engine.stale_items().await? {
                println!("{}\t{}\t{}", item.item_code, item.last_synced_at, item.name);
            }
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("INVENTORY_SYNC_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}
