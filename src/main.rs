//! Command-line driver for the bundle updater.
//!
//! Runs, probes or refreshes the cached bundle of one application and
//! executes it with an external interpreter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bundle_updater::{ProcessExecutor, UpdateOrchestrator, UpdateState, UpdaterConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

const WATCH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Application id sent to the version endpoint
    #[arg(short, long)]
    app_id: Option<String>,

    /// Version endpoint base URL
    #[arg(long)]
    server: Option<String>,

    /// Directory holding the cached payload and resources
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Interpreter the payload is piped to
    #[arg(long, default_value = "node")]
    interpreter: String,

    /// Extra argument for the interpreter (repeatable)
    #[arg(long = "interpreter-arg")]
    interpreter_args: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the local payload, then refresh it from the server
    Run {
        /// Print progress while the run is in flight
        #[arg(short, long, default_value_t = false)]
        watch: bool,
    },
    /// Report whether an update is available without downloading it
    Probe,
    /// Download and process an update if one is needed, without executing
    Sync,
    /// Download and process the advertised payload unconditionally
    Refresh,
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bundle_updater=debug"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run { watch } => {
            let watch = *watch;
            let mut orchestrator = build_orchestrator(&cli, config)?;
            let watcher = watch.then(|| {
                let reader = orchestrator.progress();
                tokio::spawn(async move {
                    let mut last = None;
                    loop {
                        let snapshot = reader.snapshot();
                        if last.as_ref() != Some(&snapshot) {
                            tracing::info!(
                                state = ?snapshot.state,
                                percent = snapshot.percent,
                                error = snapshot.error.as_deref().unwrap_or("-"),
                                "{}",
                                snapshot.description
                            );
                            last = Some(snapshot);
                        }
                        tokio::time::sleep(WATCH_INTERVAL).await;
                    }
                })
            });

            let report = orchestrator.run().await;
            if let Some(watcher) = watcher {
                watcher.abort();
            }

            let progress = orchestrator.progress().snapshot();
            if progress.state == UpdateState::Completed {
                if let Some(warning) = &progress.error {
                    tracing::warn!(%warning, "run completed with a warning");
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::Probe => {
            let orchestrator = build_orchestrator(&cli, config)?;
            let report = orchestrator.probe().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Sync => {
            let mut orchestrator = build_orchestrator(&cli, config)?;
            let outcome = orchestrator.sync().await?;
            print_sync(outcome.need_update, outcome.updated, outcome.processed.is_some());
        }
        Commands::Refresh => {
            let mut orchestrator = build_orchestrator(&cli, config)?;
            let outcome = orchestrator.force_refresh().await?;
            print_sync(outcome.need_update, outcome.updated, outcome.processed.is_some());
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<UpdaterConfig> {
    let mut config = match &cli.config {
        Some(path) => UpdaterConfig::from_json_file(path)?,
        None => UpdaterConfig::default(),
    };
    if let Some(app_id) = &cli.app_id {
        config.app_id = app_id.clone();
    }
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(root) = &cli.storage_root {
        config.storage_root = root.clone();
    }
    if config.local_reference_base.is_empty() {
        config.local_reference_base = format!("file://{}/", config.storage_root.display());
    }
    Ok(config)
}

fn build_orchestrator(cli: &Cli, config: UpdaterConfig) -> anyhow::Result<UpdateOrchestrator> {
    let executor = ProcessExecutor::new(&cli.interpreter).args(cli.interpreter_args.iter().cloned());
    UpdateOrchestrator::builder(config)
        .with_executor(Arc::new(executor))
        .build()
        .context("failed to set up the updater")
}

fn print_sync(need_update: bool, updated: bool, processed: bool) {
    println!("need_update: {need_update}");
    println!("updated:     {updated}");
    println!("processed:   {processed}");
}
