//! CLI argument parsing for gputrace

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for collected events
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON lines for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "gputrace")]
#[command(version)]
#[command(about = "GPU driver callback and device activity tracer", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Trace a synthetic multi-threaded workload on the simulated driver
    Simulate(SimulateArgs),
    /// Report why tracing would not work on this host
    Diagnose(DiagnoseArgs),
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Worker threads issuing driver calls
    #[arg(short = 't', long, default_value = "2")]
    pub threads: usize,

    /// Kernel launches per thread
    #[arg(short = 'n', long, default_value = "8")]
    pub launches: usize,

    /// Simulated GPUs
    #[arg(long, default_value = "1")]
    pub devices: u32,

    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Cap on callback events (overrides the configuration file, 0 = unlimited)
    #[arg(long = "max-callback-events", value_name = "N")]
    pub max_callback_events: Option<usize>,

    /// Annotation pushed around every launch
    #[arg(long, default_value = "step")]
    pub annotation: String,

    /// Do not collect device activity records
    #[arg(long = "no-activity")]
    pub no_activity: bool,

    /// Synchronize contexts before the session ends
    #[arg(long = "sync-devices")]
    pub sync_devices: bool,

    /// Seed for the workload generator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct DiagnoseArgs {
    /// Simulate a host without GPUs
    #[arg(long = "no-gpu")]
    pub no_gpu: bool,

    /// Simulate a process without tracing privileges
    #[arg(long = "unprivileged")]
    pub unprivileged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::parse_from(["gputrace", "simulate"]);
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.threads, 2);
        assert_eq!(args.launches, 8);
        assert_eq!(args.format, OutputFormat::Text);
        assert!(!args.no_activity);
        assert!(args.config.is_none());
        assert!(!cli.debug);
    }

    #[test]
    fn test_simulate_flags() {
        let cli = Cli::parse_from([
            "gputrace",
            "simulate",
            "--threads",
            "4",
            "--max-callback-events",
            "10",
            "--no-activity",
            "--format",
            "json",
            "--debug",
        ]);
        assert!(cli.debug);
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.threads, 4);
        assert_eq!(args.max_callback_events, Some(10));
        assert!(args.no_activity);
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn test_diagnose_flags() {
        let cli = Cli::parse_from(["gputrace", "diagnose", "--unprivileged"]);
        let Command::Diagnose(args) = cli.command else {
            panic!("expected diagnose");
        };
        assert!(args.unprivileged);
        assert!(!args.no_gpu);
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["gputrace"]).is_err());
    }
}
