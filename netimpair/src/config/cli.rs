use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "netimpair", version, about = "Transparent network impairment tunnel")]
pub struct CliOpt {
    /// The log level used when `RUST_LOG` is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// How log lines are formatted
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Full)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Full,
    Compact,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Bridge the two configured interfaces through the impairment chains
    Run(RunOpt),
    /// Check a configuration file without touching any interface
    Validate(ValidateOpt),
}

#[derive(Parser, Debug, Clone)]
pub struct RunOpt {
    /// Path to the TOML (or `.json`) configuration, re-read on SIGHUP
    #[arg(long)]
    pub config: PathBuf,

    /// The random seed governing every probabilistic impairment
    #[arg(long, default_value_t = 42, conflicts_with = "non_deterministic")]
    pub rng_seed: u64,

    /// Whether the run should be non-deterministic, i.e. using a non-constant seed for the random
    /// number generators
    #[arg(long)]
    pub non_deterministic: bool,

    /// Capacity of every channel between stages
    #[arg(long, default_value_t = impairment_pipeline::tunnel::DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    /// Directory in which to write a pcapng capture per direction
    #[arg(long)]
    pub pcap_dir: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct ValidateOpt {
    /// Path to the configuration to check
    #[arg(long)]
    pub config: PathBuf,
}
