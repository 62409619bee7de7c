/*
[INPUT]:  serve/reconcile/status/list/stop subcommands
[OUTPUT]: Orchestrator lifecycle driven from the terminal, task summaries on stdout
[POS]:    CLI supervision flows
[UPDATE]: When serve shutdown handling or report formatting changes
*/

use anyhow::{Context, Result};
use aster_auto_core::Database;
use aster_auto_core::types::{TaskId, TaskStatus, UserId};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use aster_auto_orchestrator::{
    AppConfig, OrchestratorParts, ReconcileReport, StrategyRegistry, TaskOrchestrator, TaskService,
    TaskSummary,
};

async fn bootstrap(
    config: AppConfig,
    config_path: &Path,
) -> Result<(TaskOrchestrator, ReconcileReport)> {
    let parts = OrchestratorParts::from_config(
        config,
        config_path,
        Arc::new(StrategyRegistry::builtin()),
    )?;
    TaskOrchestrator::bootstrap(parts)
        .await
        .context("bootstrap orchestrator")
}

fn task_service(config: &AppConfig) -> Result<TaskService> {
    let db = Database::new(&config.database.path).context("open task store")?;
    Ok(TaskService::new(db, Arc::new(StrategyRegistry::builtin())))
}

pub async fn serve(
    config: AppConfig,
    config_path: &Path,
    tasks: Vec<TaskId>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (orchestrator, report) = bootstrap(config, config_path).await?;
    print_report(&report);

    for task_id in tasks {
        match orchestrator.start(task_id).await {
            Ok(started) => info!(
                task_id,
                pid = started.identity.pid,
                egress = ?started.egress,
                "task launched"
            ),
            Err(err) => error!(task_id, kind = ?err.kind(), error = %err, "failed to start task"),
        }
    }

    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("shutdown signal received");
            orchestrator
                .shutdown_and_wait()
                .await
                .context("shutdown tasks")?;
        }
        _ = orchestrator.wait_idle() => {
            info!("no supervised tasks remain");
        }
    }
    Ok(())
}

pub async fn reconcile(config: AppConfig, config_path: &Path) -> Result<()> {
    let (_orchestrator, report) = bootstrap(config, config_path).await?;
    print_report(&report);
    Ok(())
}

pub async fn stop(config: AppConfig, config_path: &Path, task_id: TaskId) -> Result<()> {
    let (orchestrator, _) = bootstrap(config, config_path).await?;
    orchestrator.stop(task_id).await?;
    let summary = orchestrator.summary(task_id).await?;
    print_summary(&summary);
    Ok(())
}

pub fn status(config: AppConfig, task_id: TaskId, json: bool) -> Result<()> {
    let summary = task_service(&config)?.summary(task_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

pub fn list(config: AppConfig, user_id: Option<UserId>) -> Result<()> {
    let summaries = task_service(&config)?.list_summaries(user_id)?;
    if summaries.is_empty() {
        println!("{}", style("No tasks found.").yellow());
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{:>4}  {:<20} {:<10} rounds {}/{}  success {:.1}%",
            summary.id,
            summary.name,
            styled_status(summary.status),
            summary.stats.recorded_rounds(),
            summary.rounds,
            summary.success_rate
        );
    }
    Ok(())
}

fn styled_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        TaskStatus::Running => style(text).green(),
        TaskStatus::Completed => style(text).cyan(),
        TaskStatus::Error => style(text).red(),
        TaskStatus::Created | TaskStatus::Stopped => style(text).dim(),
    }
}

fn print_report(report: &ReconcileReport) {
    println!(
        "{} examined {}, repaired {:?}, adopted {:?}",
        style("Reconciled").bold(),
        report.examined,
        report.repaired,
        report.adopted
    );
}

fn print_summary(summary: &TaskSummary) {
    println!(
        "{} {} ({})",
        style("Task").bold(),
        style(&summary.name).cyan(),
        summary.id
    );
    println!("  status        {}", styled_status(summary.status));
    if let Some(pid) = summary.process_id {
        println!("  pid           {pid}");
    }
    if let Some(session) = &summary.proxy_session {
        println!("  proxy session {session}");
    }
    println!(
        "  rounds        {} of {} ({} ok, {} failed)",
        summary.stats.recorded_rounds(),
        summary.rounds,
        summary.stats.successful_rounds,
        summary.stats.failed_rounds
    );
    println!("  success rate  {:.1}%", summary.success_rate);
    println!(
        "  volume        buy {} / sell {} USDT, fees {}",
        summary.stats.buy_volume_usdt, summary.stats.sell_volume_usdt, summary.stats.total_fees_usdt
    );
    if let Some(secs) = summary.duration_secs {
        println!("  duration      {secs}s");
    }
    if let Some(err) = &summary.last_error {
        println!("  last error    {}", style(err).red());
    }
}
