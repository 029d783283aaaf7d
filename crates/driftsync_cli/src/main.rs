//! DriftSync CLI
//!
//! Command-line tools for inspecting and exercising the sync engine.
//!
//! # Commands
//!
//! - `diff` - Compute the delta patch between two JSON documents
//! - `apply` - Apply a delta patch to a JSON document
//! - `merge` - Resolve a three-way conflict
//! - `interval` - Explain the adaptive sync interval for given conditions
//! - `simulate` - Run a sync session against the in-memory backend

mod commands;

use clap::{Parser, Subcommand};
use driftsync_queue::Priority;
use driftsync_scheduler::{NetworkQuality, PowerState};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::merge::StrategyArg;

/// DriftSync command-line tools.
#[derive(Parser)]
#[command(name = "driftsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Pretty-print JSON output
    #[arg(global = true, long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the delta patch that turns OLD into NEW
    Diff {
        /// Old JSON object
        old: PathBuf,

        /// New JSON object
        new: PathBuf,
    },

    /// Apply a delta patch to a JSON object
    Apply {
        /// Base JSON object
        base: PathBuf,

        /// Patch produced by `diff`
        patch: PathBuf,

        /// Skip source and target checksum validation
        #[arg(long)]
        no_verify: bool,
    },

    /// Resolve a conflict between a local and a remote version
    Merge {
        /// Local JSON object
        #[arg(short, long)]
        local: PathBuf,

        /// Remote JSON object
        #[arg(short, long)]
        remote: PathBuf,

        /// Last synced JSON object
        #[arg(short, long)]
        base: Option<PathBuf>,

        /// Collection name
        #[arg(short, long, default_value = "records")]
        collection: String,

        /// Resolution strategy
        #[arg(short, long, value_enum, default_value_t = StrategyArg::FieldMerge)]
        strategy: StrategyArg,
    },

    /// Explain the sync interval for an entity
    Interval {
        /// Entity priority (critical, high, normal, low)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Observed local changes per hour
        #[arg(long, default_value = "0")]
        changes_per_hour: f64,

        /// Recent sync success rate in [0, 1]
        #[arg(long)]
        success_rate: Option<f64>,

        /// Network quality (offline, poor, fair, good, excellent)
        #[arg(long, default_value = "good")]
        network: NetworkQuality,

        /// Power state (critical, low, normal, charging)
        #[arg(long, default_value = "normal")]
        power: PowerState,
    },

    /// Run a sync session against the in-memory backend
    Simulate {
        /// Records to create and edit
        #[arg(short, long, default_value = "20")]
        records: usize,

        /// Make every Nth record conflict with a remote edit (0 disables)
        #[arg(long, default_value = "4")]
        conflict_every: usize,

        /// Make every Nth update fail once (0 disables)
        #[arg(long, default_value = "5")]
        fail_every: usize,

        /// Attempts before an operation is dead-lettered
        #[arg(long, default_value = "3")]
        max_attempts: u32,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays valid JSON
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let output = match cli.command {
        Commands::Diff { old, new } => commands::diff::run(&old, &new)?,
        Commands::Apply {
            base,
            patch,
            no_verify,
        } => commands::apply::run(&base, &patch, !no_verify)?,
        Commands::Merge {
            local,
            remote,
            base,
            collection,
            strategy,
        } => commands::merge::run(&local, &remote, base.as_deref(), &collection, strategy)?,
        Commands::Interval {
            priority,
            changes_per_hour,
            success_rate,
            network,
            power,
        } => commands::interval::run(priority, changes_per_hour, success_rate, network, power)?,
        Commands::Simulate {
            records,
            conflict_every,
            fail_every,
            max_attempts,
        } => commands::simulate::run(&commands::simulate::SimulateOptions {
            records,
            conflict_every,
            fail_every,
            max_attempts,
        })?,
        Commands::Version => {
            println!("DriftSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("DriftSync Core v{}", driftsync_core::VERSION);
            return Ok(());
        }
    };

    commands::print_json(&output, cli.pretty)?;
    Ok(())
}
