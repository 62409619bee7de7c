/*
[INPUT]:  --log-level filter, runner log directory, task id
[OUTPUT]: Global tracing subscriber (stderr, plus a per-task rolling file for execution units)
[POS]:    Logging layer - initialised once per process by the binary
[UPDATE]: When log destinations or file naming change
*/

use anyhow::{Context, Result, anyhow};
use aster_auto_core::types::TaskId;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

pub fn task_log_file_name(task_id: TaskId) -> String {
    format!("task-{task_id}.log")
}

/// Stderr plus a daily rolling `task-<id>.log` under `log_dir`. Keep the guard alive until exit.
pub fn init_runner_tracing(log_level: &str, log_dir: &Path, task_id: TaskId) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(log_dir, task_log_file_name(task_id));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize runner tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_log_file_name() {
        assert_eq!(task_log_file_name(12), "task-12.log");
    }
}
