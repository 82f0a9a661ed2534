//! Command-line interface, grounded in the teacher's `clap::Parser`
//! derive layout in `main.rs` (subcommand enum + per-command flags).

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "omron-bp-bridge")]
#[command(about = "Read OMRON blood-pressure records over BLE and forward them to a cloud fitness service and a pub/sub bus")]
pub struct Cli {
    /// Path to a TOML config file. Falls back to built-in defaults if omitted.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Force debug-level logging regardless of the config file.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a single sync cycle and exit
    Sync {
        /// Read device and log what would happen without pushing anywhere
        #[arg(long)]
        dry_run: bool,

        /// Only push to the cloud sink, skipping the bus
        #[arg(long)]
        cloud_only: bool,

        /// Only push to the bus sink, skipping the cloud
        #[arg(long)]
        bus_only: bool,
    },

    /// Run sync cycles forever at the configured interval
    Daemon {
        /// Override `omron.poll_interval_minutes` from the config file
        #[arg(short, long)]
        interval: Option<u64>,

        #[arg(long)]
        cloud_only: bool,

        #[arg(long)]
        bus_only: bool,
    },

    /// Re-attempt delivery of ledger rows not yet marked delivered
    Retry {
        /// Maximum rows to retry per sink
        #[arg(short, long, default_value = "100")]
        limit: i64,
    },

    /// Print ledger statistics and exit
    Stats {
        /// Restrict to one user slot
        #[arg(short, long)]
        user_slot: Option<u32>,
    },
}
