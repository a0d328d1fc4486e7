//! CLI module for sshproxy
//!
//! This module provides the command-line interface using clap derive macros.

pub mod args;
pub mod commands;
pub mod exit_code;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use args::{CompletionArgs, ConfigArgs, ReplayArgs, RunArgs};

/// Intercepting SSH proxy with an audit trail
#[derive(Parser, Debug)]
#[command(name = "sshproxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path; `$SSHPROXY_CONFIG` is consulted when absent
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy in the foreground
    Run(RunArgs),

    /// Print one sub-stream of a recording
    Replay(ReplayArgs),

    /// Show or validate configuration
    Config(ConfigArgs),

    /// Show version information
    Version,

    /// Generate shell completions
    Completion(CompletionArgs),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "sshproxy",
            "--verbose",
            "run",
            "--backend",
            "http://accounts:8080",
            "--listen",
            "0.0.0.0:2222",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.backend.as_deref(), Some("http://accounts:8080"));
                assert_eq!(args.listen.as_deref(), Some("0.0.0.0:2222"));
                assert!(args.log.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_replay_defaults() {
        let cli = Cli::try_parse_from(["sshproxy", "replay", "/var/log/sshproxy/42.rec"]).unwrap();
        match cli.command {
            Commands::Replay(args) => {
                assert_eq!(args.file, PathBuf::from("/var/log/sshproxy/42.rec"));
                assert_eq!(args.tag, 2);
                assert!(!args.no_pace);
                assert!(!args.follow);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["sshproxy", "--verbose", "--quiet", "version"]).is_err());
    }

    #[test]
    fn test_config_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["sshproxy", "config", "--format", "yaml"]).is_err());
    }
}
