mod config;
mod coordinator;
mod data_dir;
mod sequencer;
mod signals;
mod telemetry;
mod timestamp;
mod watcher;
mod work_loop;
mod worker;

use clap::Parser;
use config::WorkerConfig;
use coordinator::ExitCoordinator;
use signals::SignalSource;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use worker::Worker;

const EXIT_WORK_FAILED: u8 = 1;
const EXIT_STARTUP_FAILED: u8 = 2;

/// A periodic background worker: appends a timestamp every tick and shuts
/// down gracefully on signals or a host-created shutdown file.
#[derive(Parser, Debug)]
#[command(name = "webjob-worker", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "worker.toml")]
    config: PathBuf,

    /// Stop after this many iterations (overrides config)
    #[arg(long)]
    max_iterations: Option<u64>,

    /// Output directory (overrides config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watcher polls, ignored stop requests)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn resolve_config(cli: &Cli) -> Result<WorkerConfig, config::ConfigError> {
    let mut config = WorkerConfig::load(&cli.config)?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(max) = cli.max_iterations {
        config.work.max_iterations = Some(max);
    }
    if let Some(dir) = &cli.output_dir {
        config.work.output_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_STARTUP_FAILED);
        }
    };

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => tracing::warn!(error = %e, "failed to render config"),
        }
        return ExitCode::SUCCESS;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "webjob-worker starting");

    let coordinator = ExitCoordinator::new();
    let signals = SignalSource::install(&coordinator);

    let result = Worker::new(config, coordinator)
        .with_resource("signal listeners", move || {
            signals.shutdown();
            Ok(())
        })
        .run()
        .await;

    match result {
        Ok(outcome) => {
            let (origin, requested_at) = match &outcome.stop {
                Some(stop) => (stop.origin.to_string(), stop.requested_at.to_rfc3339()),
                None => ("none".to_string(), String::new()),
            };
            tracing::info!(
                iterations = outcome.iterations,
                origin = %origin,
                requested_at = %requested_at,
                heartbeats = outcome.shutdown.heartbeats,
                released = outcome.shutdown.released.len(),
                clean_shutdown = outcome.shutdown.is_clean(),
                "worker stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) if e.is_startup() => {
            tracing::error!(error = %e, "worker failed to start");
            ExitCode::from(EXIT_STARTUP_FAILED)
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                clean_shutdown = ?e.shutdown_report().map(|r| r.is_clean()),
                "worker stopped after a failure"
            );
            ExitCode::from(EXIT_WORK_FAILED)
        }
    }
}
