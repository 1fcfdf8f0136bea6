mod commands;
mod infra;
mod obs;

use clap::{Parser, Subcommand};
use commands::Command;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "siphon-etl")]
#[command(about = "Siphon crypto price ETL", version, arg_required_else_help = true)]
#[command(
    after_help = "Examples:\n  siphon-etl run --config configs/siphon.toml\n  siphon-etl schedule --config configs/siphon.toml --max-runs 12\n  siphon-etl fetch --config configs/siphon.toml\n  siphon-etl load --config configs/siphon.toml --uri file://crypto-data-bucket/crypto_raw/prices_20240101000000.json\n  siphon-etl migrate --config configs/siphon.toml\n"
)]
struct Cli {
    /// Log filter when env SIPHON_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format: text | json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Expose prometheus metrics on this host:port.
    #[arg(long)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// One full pipeline run: fetch, stage, load, transform.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run the pipeline on its fixed interval.
    Schedule {
        #[arg(long)]
        config: PathBuf,
        /// Stop after this many runs (runs until interrupted when omitted).
        #[arg(long)]
        max_runs: Option<u64>,
    },
    /// Fetch and stage one price batch without loading it.
    Fetch {
        #[arg(long)]
        config: PathBuf,
    },
    /// Load one staged blob into the raw table.
    Load {
        #[arg(long)]
        config: PathBuf,
        /// Locator of the staged blob, e.g. file://bucket/prefix/blob.json
        #[arg(long)]
        uri: String,
    },
    /// Rebuild the clean hourly table from the raw table.
    Transform {
        #[arg(long)]
        config: PathBuf,
    },
    /// Apply warehouse migrations from a SQL file.
    Migrate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "platform/ops/migrations/0001_create_raw_prices.sql")]
        migrations: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = obs::init_tracing(&cli.log_level, &cli.log_format) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    if let Err(err) = obs::init_metrics(cli.metrics_addr.as_deref()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    let command = match cli.command {
        CliCommand::Run { config } => Command::Run { config },
        CliCommand::Schedule { config, max_runs } => Command::Schedule { config, max_runs },
        CliCommand::Fetch { config } => Command::Fetch { config },
        CliCommand::Load { config, uri } => Command::Load { config, uri },
        CliCommand::Transform { config } => Command::Transform { config },
        CliCommand::Migrate { config, migrations } => Command::Migrate { config, migrations },
    };

    if let Err(err) = commands::run(command) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
