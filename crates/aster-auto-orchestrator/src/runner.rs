/*
[INPUT]:  Task id, AppConfig (via ASTER_AUTO_CONFIG), shutdown token from signal handlers
[OUTPUT]: One stat delta per executed round, last_error on fatal abort, process exit code
[POS]:    Execution unit - the body of `aster-auto run-task <id>`
[UPDATE]: When round pacing, resume rules or shutdown handling change
*/

use anyhow::{Context, Result};
use aster_auto_core::Database;
use aster_auto_core::types::{StatDelta, Task, TaskId, WalletCredentials};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::proxy::{EgressIdentity, ProxySessionAllocator};
use crate::strategy::{RoundContext, RoundError, RoundStrategy, StrategyRegistry, merge_parameters};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every configured round has a recorded outcome.
    Finished { rounds: u32 },
    /// Stopped on request after `recorded` rounds.
    Cancelled { recorded: u32 },
    /// A fatal round error; `last_error` was recorded.
    Aborted(String),
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Finished { .. } | RunOutcome::Cancelled { .. } => 0,
            RunOutcome::Aborted(_) => 1,
        }
    }
}

pub struct TaskRunner {
    db: Database,
    task: Task,
    credentials: WalletCredentials,
    egress: Option<EgressIdentity>,
    strategy: Box<dyn RoundStrategy>,
    round_grace: Duration,
}

impl TaskRunner {
    pub fn new(
        db: Database,
        task: Task,
        credentials: WalletCredentials,
        egress: Option<EgressIdentity>,
        strategy: Box<dyn RoundStrategy>,
        round_grace: Duration,
    ) -> Self {
        Self {
            db,
            task,
            credentials,
            egress,
            strategy,
            round_grace,
        }
    }

    /// Re-read everything the unit needs from the store. Failures after the store opens
    /// are recorded as the task's `last_error`.
    pub async fn prepare(
        config: AppConfig,
        registry: &StrategyRegistry,
        task_id: TaskId,
    ) -> Result<Self> {
        let db = Database::new(&config.database.path).context("open task store")?;
        match Self::load(db.clone(), config, registry, task_id).await {
            Ok(runner) => Ok(runner),
            Err(err) => {
                if let Err(report_err) = db.report_error(task_id, &format!("{err:#}")) {
                    warn!(task_id, error = %report_err, "failed to record startup error");
                }
                Err(err)
            }
        }
    }

    async fn load(
        db: Database,
        config: AppConfig,
        registry: &StrategyRegistry,
        task_id: TaskId,
    ) -> Result<Self> {
        let vault = config.vault()?;
        let task = db
            .get_task(task_id)?
            .with_context(|| format!("task {task_id} not found"))?;
        let wallet = db
            .get_wallet(task.wallet_id)?
            .with_context(|| format!("wallet {} not found", task.wallet_id))?;
        let strategy_row = db
            .get_strategy(task.strategy_id)?
            .with_context(|| format!("strategy {} not found", task.strategy_id))?;

        let credentials = vault
            .decrypt_credentials(&wallet)
            .context("decrypt wallet credentials")?;
        let parameters =
            merge_parameters(&strategy_row.default_parameters, &task.strategy_parameters);
        let strategy = registry.build(&strategy_row.strategy_type, &parameters)?;

        let round_grace = config.runner.round_grace();
        let proxies = ProxySessionAllocator::new(config.proxy, Arc::new(db.clone()));
        let egress = proxies.allocate(task_id).await;

        info!(
            task_id,
            strategy = %strategy_row.strategy_type,
            wallet_type = %credentials.wallet_type(),
            proxy = %egress.as_ref().map(EgressIdentity::display_url).unwrap_or_else(|| "direct".to_string()),
            "execution unit prepared"
        );
        Ok(Self::new(db, task, credentials, egress, strategy, round_grace))
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<RunOutcome> {
        let task_id = self.task.id;
        let rounds = self.task.params.rounds;
        let first_round = self.task.stats.recorded_rounds() + 1;
        let interval = Duration::from_secs(u64::from(self.task.params.interval_secs));
        if first_round > 1 {
            info!(task_id, first_round, rounds, "resuming after recorded rounds");
        }

        for round in first_round..=rounds {
            if shutdown.is_cancelled() {
                return Ok(self.cancelled(round - 1));
            }

            let ctx = RoundContext {
                task: &self.task,
                credentials: &self.credentials,
                egress: self.egress.as_ref(),
            };
            let mut in_flight = self.strategy.execute_round(round, &ctx);
            let result = tokio::select! {
                result = &mut in_flight => result,
                _ = shutdown.cancelled() => {
                    info!(task_id, round, grace = ?self.round_grace, "stop requested, finishing in-flight round");
                    match timeout(self.round_grace, &mut in_flight).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(task_id, round, "in-flight round abandoned");
                            drop(in_flight);
                            return Ok(self.cancelled(round - 1));
                        }
                    }
                }
            };
            drop(in_flight);

            match result {
                Ok(report) => {
                    self.record(report.into_delta())?;
                    info!(task_id, round, rounds, "round succeeded");
                }
                Err(RoundError::Recoverable(reason)) => {
                    warn!(task_id, round, reason = %reason, "round failed, continuing");
                    self.record(StatDelta::failure())?;
                }
                Err(err @ RoundError::Fatal(_)) => {
                    let message = err.to_string();
                    error!(task_id, round, error = %message, "round failed fatally, aborting");
                    self.record(StatDelta::failure())?;
                    self.db
                        .report_error(task_id, &message)
                        .context("record fatal round error")?;
                    return Ok(RunOutcome::Aborted(message));
                }
            }

            if round < rounds {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(self.cancelled(round)),
                    _ = sleep(interval) => {}
                }
            }
        }

        info!(task_id, rounds, "all rounds recorded");
        Ok(RunOutcome::Finished { rounds })
    }

    fn record(&mut self, delta: StatDelta) -> Result<()> {
        self.task.stats = self
            .db
            .append_stat_delta(self.task.id, &delta)
            .context("append round statistics")?;
        Ok(())
    }

    fn cancelled(&self, recorded: u32) -> RunOutcome {
        info!(task_id = self.task.id, recorded, "execution unit stopping on request");
        RunOutcome::Cancelled { recorded }
    }
}
