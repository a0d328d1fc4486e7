//! Run command - execute the proxy in the foreground

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::backend::HttpStore;
use crate::cli::args::RunArgs;
use crate::config::{self, ExpandedConfig};
use crate::logging::{self, LogConfig};
use crate::ssh::Server;

/// Merge command line overrides into the expanded configuration
pub fn apply_overrides(mut config: ExpandedConfig, args: &RunArgs) -> ExpandedConfig {
    if let Some(url) = &args.backend {
        config.backend_url = url.trim_end_matches('/').to_string();
    }
    if let Some(listen) = &args.listen {
        config.server.listen = Some(listen.clone());
    }
    if let Some(log) = &args.log {
        config.log_path = Some(log.clone());
    }
    config
}

/// Execute the run command
pub async fn execute(args: RunArgs, config_path: Option<PathBuf>, log_config: LogConfig) -> Result<()> {
    let file = config::load(config_path.as_deref())
        .context("Failed to load configuration")?;
    let config = file.config.expand().context("Invalid configuration")?;
    let config = apply_overrides(config, &args);

    let log_config = match &config.log_path {
        Some(path) => log_config.with_jsonl_path(path),
        None => log_config,
    };
    let guard = logging::init_with_config(log_config);

    if let Some(path) = &file.path {
        info!(config = %path.display(), source = %file.source, "configuration loaded");
    }
    if let Some(path) = &config.log_path {
        info!(log = %path.display(), "JSONL logging enabled");
    }

    let store = HttpStore::new(&config.backend_url, config.backend_timeout)
        .context("Failed to create account service client")?;
    info!(backend = %store.base_url(), "starting sshproxy");

    let mut server = Server::from_store(Arc::new(store), config.server, guard.events())
        .await
        .context("Failed to load server settings from the account service")?;
    let local = server
        .bind()
        .await
        .with_context(|| format!("Failed to listen on {}", server.listen()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    info!(listen = %local, "Proxy server started. Press Ctrl+C to stop.");
    server.run(shutdown_rx).await.context("Server failed")?;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use signal::unix::{SignalKind, signal as unix_signal};

    let mut term = match unix_signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received Ctrl+C, stopping..."),
        _ = term.recv() => info!("Received SIGTERM, stopping..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = signal::ctrl_c().await;
    info!("Received Ctrl+C, stopping...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn run_args(backend: Option<&str>, listen: Option<&str>) -> RunArgs {
        RunArgs {
            backend: backend.map(String::from),
            listen: listen.map(String::from),
            log: None,
        }
    }

    #[test]
    fn test_overrides_replace_config_values() {
        let config = Config::default().expand().unwrap();
        let merged = apply_overrides(config, &run_args(Some("http://accounts:9000/"), Some("[::]:2022")));
        assert_eq!(merged.backend_url, "http://accounts:9000");
        assert_eq!(merged.server.listen.as_deref(), Some("[::]:2022"));
    }

    #[test]
    fn test_no_overrides_keep_config() {
        let config = Config::default().expand().unwrap();
        let merged = apply_overrides(config, &run_args(None, None));
        assert_eq!(merged.backend_url, "http://127.0.0.1:8080");
        assert!(merged.server.listen.is_none());
        assert!(merged.log_path.is_none());
    }
}
