//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Operational safety guards for the invoice-processing admin API
#[derive(Parser, Debug)]
#[command(name = "ops-guard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OPS_GUARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "OPS_GUARD_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "OPS_GUARD_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OPS_GUARD_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OPS_GUARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the guard server (default)
    Serve,

    /// Print the effective configuration as JSON and exit
    ShowConfig,
}
