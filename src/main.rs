mod cli;
mod config;
mod devices;
mod discovery;
mod driver;
mod error;
mod ledger;
mod logging;
mod models;
mod orchestrator;
mod protocol;
mod sinks;
mod transport;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use cli::{Cli, Commands};
use config::Config;
use ledger::Ledger;
use orchestrator::Orchestrator;
use sinks::bus::BusSink;
use sinks::cloud::{CloudSink, HttpCloudClient};
use sinks::Sink;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.logging, cli.debug);

    match cli.command {
        Commands::Sync { dry_run, cloud_only, bus_only } => {
            run_sync(config, dry_run, cloud_only, bus_only).await
        }
        Commands::Daemon { interval, cloud_only, bus_only } => {
            run_daemon(config, interval, cloud_only, bus_only).await
        }
        Commands::Retry { limit } => run_retry(config, limit).await,
        Commands::Stats { user_slot } => run_stats(config, user_slot),
    }
}

/// Build the cloud sink, unless disabled by config or the `--bus-only`
/// flag. A missing token file is logged and treated as "cloud disabled"
/// rather than a hard failure, since a bridge with only the bus enabled is
/// a valid configuration.
fn build_cloud_sink(config: &Config, bus_only: bool) -> Option<Box<dyn Sink>> {
    if bus_only || !config.cloud.enabled {
        return None;
    }
    match HttpCloudClient::from_token_file(config.cloud.base_url.clone(), &config.cloud.token_path) {
        Ok(client) => Some(Box::new(CloudSink::new(Box::new(client)))),
        Err(e) => {
            warn!("cloud sink disabled: {e}");
            None
        }
    }
}

fn build_bus_sink(config: &Config, cloud_only: bool) -> Option<Box<dyn Sink>> {
    if cloud_only || !config.bus.enabled {
        return None;
    }
    let user_identities =
        config.users.iter().map(|u| (u.user_slot, u.remote_identity.clone())).collect();
    Some(Box::new(BusSink::new(
        &config.bus.host,
        config.bus.port,
        &config.bus.base_topic,
        "omron-bp-bridge",
        user_identities,
    )))
}

fn open_ledger(config: &Config) -> Result<Ledger, ExitCode> {
    Ledger::open(&config.deduplication.database_path).map_err(|e| {
        error!("failed to open ledger: {e}");
        ExitCode::FAILURE
    })
}

async fn run_sync(config: Config, dry_run: bool, cloud_only: bool, bus_only: bool) -> ExitCode {
    let ledger = match open_ledger(&config) {
        Ok(l) => l,
        Err(code) => return code,
    };
    let cloud = build_cloud_sink(&config, bus_only);
    let bus = build_bus_sink(&config, cloud_only);
    let mut orchestrator = Orchestrator::new(config, ledger, cloud, bus);

    let summary = orchestrator.sync(dry_run).await;
    if !summary.errors.is_empty() {
        for e in &summary.errors {
            error!("{e}");
        }
        return ExitCode::FAILURE;
    }
    info!(
        "synced {} new record(s): cloud {} pushed/{} skipped, bus {} pushed/{} skipped",
        summary.new_records,
        summary.cloud.pushed,
        summary.cloud.skipped,
        summary.bus.pushed,
        summary.bus.skipped,
    );
    ExitCode::SUCCESS
}

async fn run_daemon(
    mut config: Config,
    interval: Option<u64>,
    cloud_only: bool,
    bus_only: bool,
) -> ExitCode {
    if let Some(minutes) = interval {
        config.omron.poll_interval_minutes = minutes;
    }
    let ledger = match open_ledger(&config) {
        Ok(l) => l,
        Err(code) => return code,
    };
    let cloud = build_cloud_sink(&config, bus_only);
    let bus = build_bus_sink(&config, cloud_only);
    let mut orchestrator = Orchestrator::new(config, ledger, cloud, bus);

    let shutdown = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    let signal_shutdown = shutdown.clone();
    let signal_interrupted = interrupted.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {
                    info!("received Ctrl-C, shutting down...");
                    signal_interrupted.store(true, Ordering::SeqCst);
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down...");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received Ctrl-C, shutting down...");
            signal_interrupted.store(true, Ordering::SeqCst);
        }
        signal_shutdown.store(true, Ordering::SeqCst);
    });

    orchestrator.run_daemon(shutdown).await;

    if interrupted.load(Ordering::SeqCst) {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_retry(config: Config, limit: i64) -> ExitCode {
    let ledger = match open_ledger(&config) {
        Ok(l) => l,
        Err(code) => return code,
    };
    let cloud = build_cloud_sink(&config, false);
    let bus = build_bus_sink(&config, false);
    let mut orchestrator = Orchestrator::new(config, ledger, cloud, bus);

    let cloud_result = orchestrator.retry_pending_cloud(limit).await;
    let bus_result = orchestrator.retry_pending_bus(limit).await;

    let mut ok = true;
    match cloud_result {
        Ok(s) => info!("cloud retry: {} pushed, {} failed", s.pushed, s.failed),
        Err(e) => {
            error!("cloud retry failed: {e}");
            ok = false;
        }
    }
    match bus_result {
        Ok(s) => info!("bus retry: {} pushed, {} failed", s.pushed, s.failed),
        Err(e) => {
            error!("bus retry failed: {e}");
            ok = false;
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_stats(config: Config, user_slot: Option<u32>) -> ExitCode {
    let ledger = match open_ledger(&config) {
        Ok(l) => l,
        Err(code) => return code,
    };
    match ledger.statistics(user_slot) {
        Ok(stats) => {
            println!("Total records:   {}", stats.total_records);
            println!("Cloud delivered: {}", stats.cloud_delivered);
            println!("Bus delivered:   {}", stats.bus_delivered);
            if let Some(first) = stats.first_record {
                println!("First record:    {}", first.format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(last) = stats.last_record {
                println!("Last record:     {}", last.format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(avg) = stats.avg_systolic {
                println!(
                    "Averages:        {:.1}/{:.1} mmHg, {:.1} bpm",
                    avg,
                    stats.avg_diastolic.unwrap_or_default(),
                    stats.avg_pulse.unwrap_or_default(),
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("failed to read ledger statistics: {e}");
            ExitCode::FAILURE
        }
    }
}
