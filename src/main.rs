use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use usbsync::core::{ChangeCallback, OperationEvent, OperationKind, Volume};
use usbsync::{adapters, cli, config, context::AppContext, logging};

#[derive(Parser)]
#[command(name = "usbsync")]
#[command(about = "Transfer, back up and sync between removable volumes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: ConfigArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// List the removable volumes currently mounted
    Volumes {
        #[arg(long)]
        json: bool,
    },
    /// Print the volume list every time it changes
    Watch,
    /// Copy the source tree onto every target
    Transfer(OperationArgs),
    /// Take a timestamped snapshot of the source on every target
    Backup(OperationArgs),
    /// Back up each target's mirror, then bring it up to date
    Sync(OperationArgs),
    /// Show recorded backups
    History {
        #[arg(long)]
        json: bool,

        /// Show the files of entry N (1 is the newest)
        #[arg(long, value_name = "N")]
        detail: Option<usize>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct OperationArgs {
    /// Label of the source volume
    #[arg(long)]
    source: String,

    /// Label of a target volume; repeat for several
    #[arg(long = "target", required = true)]
    targets: Vec<String>,
}

#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    ledger_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    poll_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::AppConfig::new(Some(&cli.overrides))?;
    logging::init(logging::LogConfig::from(&config));

    if let Commands::Config = cli.command {
        print!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to render configuration")?
        );
        return Ok(());
    }

    let source = adapters::get_source(config.simulation);
    let ctx = AppContext::new(config, source)
        .await
        .context("Failed to initialise")?;

    match cli.command {
        Commands::Volumes { json } => run_volumes(&ctx, json).await,
        Commands::Watch => run_watch(&ctx).await,
        Commands::Transfer(args) => run_operation(&ctx, OperationKind::Transfer, args).await,
        Commands::Backup(args) => run_operation(&ctx, OperationKind::Backup, args).await,
        Commands::Sync(args) => run_operation(&ctx, OperationKind::Sync, args).await,
        Commands::History { json, detail } => run_history(&ctx, json, detail).await,
        Commands::Config => Ok(()),
    }
}

async fn run_volumes(ctx: &AppContext, json: bool) -> Result<()> {
    let volumes = ctx.volumes().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&volumes)?);
    } else {
        print!("{}", cli::render_volumes(&volumes));
    }
    Ok(())
}

async fn run_watch(ctx: &AppContext) -> Result<()> {
    let on_change: ChangeCallback = Arc::new(|volumes: Vec<Volume>| {
        print!("{}", cli::render_volumes(&volumes));
    });
    ctx.registry.start(on_change);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    ctx.registry.stop().await;
    Ok(())
}

async fn run_operation(ctx: &AppContext, kind: OperationKind, args: OperationArgs) -> Result<()> {
    let request = ctx.request(Some(&args.source), &args.targets).await?;

    let mut events = ctx.coordinator.subscribe();
    let handle = ctx.coordinator.start(kind, request)?;

    let mut failed = None;
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = cli::render_event(&event) {
                    println!("{}", line);
                }
                match event {
                    OperationEvent::Completed { kind: done, .. } if done == kind => break,
                    OperationEvent::Failed { kind: done, reason } if done == kind => {
                        failed = Some(reason);
                        break;
                    }
                    _ => {}
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Progress display fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }

    handle.wait().await?;

    if let Some(reason) = failed {
        bail!("{} failed: {}", kind, reason);
    }
    Ok(())
}

async fn run_history(ctx: &AppContext, json: bool, detail: Option<usize>) -> Result<()> {
    let history = ctx.coordinator.history().await;

    if let Some(number) = detail {
        match cli::render_history_detail(&history, number) {
            Some(text) => print!("{}", text),
            None => bail!("No backup #{} in history", number),
        }
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else {
        print!("{}", cli::render_history(&history));
    }
    Ok(())
}
