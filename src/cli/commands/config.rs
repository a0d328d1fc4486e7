//! Config command - show or validate configuration

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::cli::args::ConfigArgs;
use crate::config::{Config, candidates, discover, parse};

/// Example configuration content
pub fn example_config() -> &'static str {
    r#"# sshproxy configuration file

# Account service the proxy authenticates users and resolves targets with
backend_url = "http://127.0.0.1:8080"
backend_timeout = "10s"

# The account service supplies listen address, host key and log directory.
# Uncomment to override them locally.
# listen = "0.0.0.0:2222"
# host_key_path = "~/.config/sshproxy/host_ed25519"
# log_dir = "/var/log/sshproxy"

# JSONL event log
# log_path = "/var/log/sshproxy/events.jsonl"

[audit]
# Write batching window of recordings, also the pace of review sessions
quantum = "200ms"
# Record every file moved with scp
file_transfers = true
# "rec": input and output multiplexed in <id>.rec
# "flat": raw output only in <id>.out
capture = "rec"
# Trace every chunk of port-forward and agent channels
debug_taps = false

[limits]
# Failed logins tolerated per client address within protect_window
protect_window = "300s"
max_failed = 3
auth_rejection_time = "1s"
# Dialing targets and proxy hops
connect_timeout = "30s"
# How long closing sessions wait for their channels
drain_timeout = "10s"
# inactivity_timeout = "1h"
"#
}

/// Parse and expand a configuration file, returning the first problem found
fn validate(path: &Path) -> Result<Config> {
    let config = parse(path)?;
    config
        .expand()
        .with_context(|| format!("Invalid values in {}", path.display()))?;
    Ok(config)
}

/// Execute the config command
pub async fn execute(args: ConfigArgs, config_path: Option<PathBuf>) -> Result<()> {
    // Show search paths
    if args.paths {
        println!("Config search paths (in priority order):");
        for (i, cp) in candidates().iter().enumerate() {
            let exists = if cp.path.exists() {
                "\x1b[32m[exists]\x1b[0m"
            } else {
                ""
            };
            println!("  {}. {} {}", i + 1, cp.source, exists);
            println!("     {}", cp.path.display());
        }
        return Ok(());
    }

    if args.example {
        match args.format.as_str() {
            "json" => {
                let config: Config =
                    toml::from_str(example_config()).context("Failed to parse example config")?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            _ => print!("{}", example_config()),
        }
        return Ok(());
    }

    let Some(path) = config_path.or_else(|| discover().map(|c| c.path)) else {
        if args.validate {
            eprintln!("Searched locations (use --paths for details):");
            for cp in candidates() {
                eprintln!("  - {}", cp.path.display());
            }
            bail!("No configuration file found");
        }
        println!("# No configuration file found");
        println!("# Use 'config --paths' to see search locations");
        println!();
        println!("# Example configuration (use --example for clean output):");
        println!();
        print!("{}", example_config());
        return Ok(());
    };

    let config = validate(&path)?;
    if args.validate {
        println!("Configuration file is valid: {}", path.display());
        return Ok(());
    }

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => {
            println!("# Configuration from: {}", path.display());
            println!();
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_example_config_parses_to_defaults() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config, Config::default());
        let expanded = config.expand().unwrap();
        assert_eq!(expanded.server.audit.quantum, Duration::from_millis(200));
    }

    #[test]
    fn test_validate_reports_bad_duration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[limits]\nprotect_window = \"soon\"\n").unwrap();
        assert!(validate(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "upstream = \"/tmp/agent.sock\"\n").unwrap();
        assert!(validate(&path).is_err());
    }
}
