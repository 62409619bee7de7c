/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Operator commands, or one execution unit when invoked as `run-task`
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

mod cli;

use anyhow::{Context, Result};
use aster_auto_core::CredentialVault;
use aster_auto_core::types::TaskId;
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aster_auto_orchestrator::config::resolve_config_path;
use aster_auto_orchestrator::logging::{init_runner_tracing, init_tracing};
use aster_auto_orchestrator::{AppConfig, StrategyRegistry, TaskRunner};
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    let config_path = resolve_config_path(args.config_path);

    match args.command {
        Command::Init { output, force } => {
            cli::init::run_init(&output, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Keygen => {
            println!("{}", CredentialVault::generate_master_key());
            Ok(ExitCode::SUCCESS)
        }
        Command::RunTask { task_id } => run_task(&config_path, task_id, &args.log_level).await,
        command => {
            init_tracing(&args.log_level)?;
            info!(config_path = %config_path.display(), "starting aster-auto");
            let config = AppConfig::load(&config_path)?;

            let shutdown = CancellationToken::new();
            setup_signal_handlers(shutdown.clone());
            cli::dispatch(command, config, &config_path, shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_task(config_path: &Path, task_id: TaskId, log_level: &str) -> Result<ExitCode> {
    let config = AppConfig::load(config_path).context("load execution unit config")?;
    let _log_guard = init_runner_tracing(log_level, &config.runner.log_dir, task_id)?;
    info!(task_id, pid = std::process::id(), "execution unit starting");

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let registry = StrategyRegistry::builtin();
    let runner = match TaskRunner::prepare(config, &registry, task_id).await {
        Ok(runner) => runner,
        Err(err) => {
            error!(task_id, error = %format!("{err:#}"), "execution unit failed to start");
            return Ok(ExitCode::FAILURE);
        }
    };

    match runner.run(shutdown).await {
        Ok(outcome) => {
            info!(task_id, ?outcome, "execution unit exiting");
            Ok(ExitCode::from(outcome.exit_code()))
        }
        Err(err) => {
            error!(task_id, error = %format!("{err:#}"), "execution unit failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
