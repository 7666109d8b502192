//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

/// Encore - measurement task scheduler
#[derive(Parser)]
#[command(
    name = "encore",
    about = "Schedules measurement tasks, records their results and serves site stats",
    version = env!("CARGO_PKG_VERSION"),
    after_help = after_help()
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log at DEBUG instead of INFO
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs here instead of the default log file
    #[arg(long = "log-file", global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run promotion, dispatch refresh and aggregation until interrupted
    Serve,

    /// Load task and schedule definitions from a YAML file
    Load {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Run one promotion cycle now
    Promote,

    /// Show definitions and the active schedule
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Select and render one task as a client would receive it
    Select {
        /// Request path; a `.js` suffix selects the JavaScript substrate
        #[arg(short, long, default_value = "/task.js")]
        path: String,

        /// Client hint as name=value (repeatable)
        #[arg(long = "hint", value_name = "NAME=VALUE", value_parser = parse_hint)]
        hints: Vec<(String, String)>,

        /// Referer of the requesting page
        #[arg(short, long)]
        referer: Option<String>,
    },

    /// Parse recorded queries and results that have not been parsed yet
    Parse,

    /// Show result counts for a site
    Stats {
        /// Site URL; query string and fragment are ignored
        #[arg(value_name = "REFERER")]
        referer: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Split a `name=value` hint
pub fn parse_hint(s: &str) -> Result<(String, String), String> {
    debug!(%s, "parse_hint: called");
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("Invalid hint '{}': expected NAME=VALUE", s)),
    }
}

/// Default log file location
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("encore")
        .join("logs")
        .join("encore.log")
}

fn after_help() -> String {
    format!("Logs are written to: {}", get_log_path().display())
}

/// Output format for status/stats commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
