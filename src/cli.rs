//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// LFX v2 authentication service - identity facade over the message bus
#[derive(Parser, Debug)]
#[command(name = "lfx-auth-service")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML); the environment still wins
    #[arg(short, long, env = "AUTH_SERVICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the NATS server URL
    #[arg(long)]
    pub nats_url: Option<String>,

    /// Override the health sidecar port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "AUTH_SERVICE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTH_SERVICE_LOG_FORMAT")]
    pub log_format: Option<String>,
}
