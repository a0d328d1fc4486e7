//! sshproxy - intercepting SSH proxy with an audit trail

use clap::{CommandFactory, Parser};
use clap_complete::env::CompleteEnv;

use sshproxy::cli::commands;
use sshproxy::cli::exit_code::ExitCode;
use sshproxy::cli::{Cli, Commands};
use sshproxy::logging::{self, LogConfig};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Handle dynamic shell completion if COMPLETE env var is set
    CompleteEnv::with_factory(Cli::command).complete();

    let cli = Cli::parse();

    let mut log_config = LogConfig::new();
    if cli.verbose {
        log_config = log_config.verbose();
    } else if cli.quiet {
        log_config = log_config.quiet();
    }

    // run sets up logging itself once it knows the event log path
    let _guard = (!matches!(cli.command, Commands::Run(_)))
        .then(|| logging::init_with_config(log_config.clone()));

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args, cli.config, log_config).await,
        Commands::Replay(args) => commands::replay::execute(args).await,
        Commands::Config(args) => commands::config::execute(args, cli.config).await,
        Commands::Version => {
            commands::version::print_version(cli.verbose);
            Ok(())
        }
        Commands::Completion(args) => commands::completion::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::Success.into(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::for_error(&e).into()
        }
    }
}
