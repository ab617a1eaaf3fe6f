use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::constants::{
    ENV_CONFIG, ENV_DATA_DIR, ENV_DEBUG, ENV_EXPORTER_ENDPOINT, ENV_GRPC_ENABLED, ENV_GRPC_PORT,
    ENV_HOST, ENV_LOG_FORMAT, ENV_PORT,
};

#[derive(Parser)]
#[command(name = "spool")]
#[command(version, about = "Durable OTLP export pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// OTLP/HTTP and operational API port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Enable debug mode (writes accepted OTLP submissions to debug folder)
    #[arg(long, global = true, env = ENV_DEBUG)]
    pub debug: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Enable OTLP gRPC endpoint
    #[arg(long, global = true, env = ENV_GRPC_ENABLED)]
    pub grpc: Option<bool>,

    /// OTLP gRPC port
    #[arg(long, global = true, env = ENV_GRPC_PORT)]
    pub grpc_port: Option<u16>,

    /// Data directory (queues, dead letters, debug output)
    #[arg(long, global = true, env = ENV_DATA_DIR)]
    pub data_dir: Option<PathBuf>,

    /// Log output format (compact or json)
    #[arg(long, global = true, env = ENV_LOG_FORMAT, value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Downstream endpoint used by the default pipelines
    #[arg(long, global = true, env = ENV_EXPORTER_ENDPOINT)]
    pub exporter_endpoint: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Parse log format from CLI/env string
fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    match s.to_lowercase().as_str() {
        "compact" | "text" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!(
            "Invalid log format '{}'. Valid options: compact, json",
            s
        )),
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the collector (default command)
    Start,
    /// Inspect or clear the durable export queues
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum QueueCommands {
    /// Show pending entries per pipeline queue
    Inspect {
        /// Only this pipeline
        #[arg(long)]
        pipeline: Option<String>,
    },
    /// Delete queued entries. Requires confirmation.
    Purge {
        /// Only this pipeline
        #[arg(long)]
        pipeline: Option<String>,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub debug: bool,
    pub config: Option<PathBuf>,
    pub grpc: Option<bool>,
    pub grpc_port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
    pub exporter_endpoint: Option<String>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        debug: cli.debug,
        config: cli.config,
        grpc: cli.grpc,
        grpc_port: cli.grpc_port,
        data_dir: cli.data_dir,
        log_format: cli.log_format,
        exporter_endpoint: cli.exporter_endpoint,
    };
    (config, cli.command)
}
