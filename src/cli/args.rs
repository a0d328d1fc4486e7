//! Argument structures for CLI commands

use clap::Args;
use clap_complete::Shell;
use std::path::PathBuf;

/// Arguments for the `run` command
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Base URL of the account service
    ///
    /// Overrides `backend_url` from the configuration file
    #[arg(short, long, env = "SSHPROXY_BACKEND", value_name = "URL")]
    pub backend: Option<String>,

    /// Listen address, overriding the account service's
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Path to JSONL event log file
    #[arg(long)]
    pub log: Option<PathBuf>,
}

/// Arguments for the `replay` command
#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// Recording to replay (`<id>.rec`)
    pub file: PathBuf,

    /// Sub-stream to print: 1 for input, 2 for output
    #[arg(short, long, default_value_t = crate::recording::TAG_OUTPUT)]
    pub tag: u8,

    /// Print as fast as possible instead of at the recorded cadence
    #[arg(long)]
    pub no_pace: bool,

    /// Keep waiting for new frames until the recording is finished
    #[arg(short, long)]
    pub follow: bool,
}

/// Arguments for the `config` command
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Validate configuration only
    #[arg(long, conflicts_with_all = ["paths", "example"])]
    pub validate: bool,

    /// Show configuration file search paths
    #[arg(long, conflicts_with = "example")]
    pub paths: bool,

    /// Show an example configuration
    #[arg(long)]
    pub example: bool,

    /// Output format
    #[arg(short, long, default_value = "toml", value_parser = ["toml", "json"])]
    pub format: String,
}

/// Arguments for the `completion` command
#[derive(Args, Debug, Clone)]
pub struct CompletionArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}
