/*
[INPUT]:  Start/stop requests, exit notifications from the supervisor
[OUTPUT]: Serialized task lifecycle: validation, credentials, egress, spawn, finalization
[POS]:    Orchestration layer - sole writer of task status outside the execution unit
[UPDATE]: When the start sequence, exit classification or locking scheme changes
*/

use anyhow::{Context, anyhow};
use aster_auto_core::types::{
    ErrorUpdate, ProcessIdentity, StatusUpdate, Task, TaskId, TaskStatus,
};
use aster_auto_core::{CredentialVault, Database};
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::proxy::{EgressTier, ProxySessionAllocator};
use crate::reconciler::{OrphanReconciler, ReconcileReport};
use crate::service::{Assignment, TaskSummary, validate_params};
use crate::state_machine::{TaskAction, TaskStateMachine};
use crate::strategy::StrategyRegistry;
use crate::supervisor::{ExitOutcome, ProcessHandle, ProcessSupervisor, RunnerCommand};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// One async mutex per key, created on first use.
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: i64) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().await.entry(key).or_default().clone();
        lock.lock_owned().await
    }
}

/// Everything the orchestrator owns. Consumed by [`TaskOrchestrator::bootstrap`].
pub struct OrchestratorParts {
    pub db: Database,
    pub vault: CredentialVault,
    pub registry: Arc<StrategyRegistry>,
    pub proxies: ProxySessionAllocator,
    pub supervisor: ProcessSupervisor,
}

impl OrchestratorParts {
    /// Wire every component from a loaded config. `config_path` is handed to execution units.
    pub fn from_config(
        config: AppConfig,
        config_path: &Path,
        registry: Arc<StrategyRegistry>,
    ) -> anyhow::Result<Self> {
        let db = Database::new(&config.database.path).context("open task store")?;
        let vault = config.vault()?;
        let command = RunnerCommand::from_config(&config.supervisor, config_path)
            .context("resolve execution unit command")?;
        let supervisor = ProcessSupervisor::new(
            command,
            config.supervisor.grace_period(),
            config.supervisor.kill_timeout(),
        );
        let proxies = ProxySessionAllocator::new(config.proxy, Arc::new(db.clone()));
        Ok(Self {
            db,
            vault,
            registry,
            proxies,
            supervisor,
        })
    }
}

struct Inner {
    db: Database,
    vault: CredentialVault,
    registry: Arc<StrategyRegistry>,
    proxies: ProxySessionAllocator,
    supervisor: ProcessSupervisor,
    task_locks: KeyedLocks,
    user_locks: KeyedLocks,
    watchers: TaskTracker,
}

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedTask {
    pub task_id: TaskId,
    pub identity: ProcessIdentity,
    pub egress: Option<EgressTier>,
    pub proxy_session: Option<String>,
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("proxies", &self.inner.proxies)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl TaskOrchestrator {
    /// Build the orchestrator and reconcile leftover `running` rows before it is handed out.
    pub async fn bootstrap(
        parts: OrchestratorParts,
    ) -> OrchestratorResult<(Self, ReconcileReport)> {
        let orchestrator = Self {
            inner: Arc::new(Inner {
                db: parts.db,
                vault: parts.vault,
                registry: parts.registry,
                proxies: parts.proxies,
                supervisor: parts.supervisor,
                task_locks: KeyedLocks::default(),
                user_locks: KeyedLocks::default(),
                watchers: TaskTracker::new(),
            }),
        };
        let report = OrphanReconciler::new(&orchestrator).run().await?;
        Ok((orchestrator, report))
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn proxies(&self) -> &ProxySessionAllocator {
        &self.inner.proxies
    }

    pub(crate) fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    pub(crate) async fn lock_task(&self, task_id: TaskId) -> OwnedMutexGuard<()> {
        self.inner.task_locks.lock(task_id).await
    }

    /// Run a synchronous store operation off the async workers.
    pub(crate) async fn blocking<T, E, F>(&self, op: F) -> OrchestratorResult<T>
    where
        T: Send + 'static,
        E: Into<OrchestratorError> + Send + 'static,
        F: FnOnce(&Database) -> Result<T, E> + Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .context("store worker panicked")?
            .map_err(Into::into)
    }

    async fn load_task(&self, task_id: TaskId) -> OrchestratorResult<Task> {
        self.blocking(move |db| db.get_task(task_id))
            .await?
            .ok_or_else(|| OrchestratorError::not_found("task", task_id))
    }

    pub async fn start(&self, task_id: TaskId) -> OrchestratorResult<StartedTask> {
        let _task_guard = self.lock_task(task_id).await;
        let mut task = self.load_task(task_id).await?;

        if task.status == TaskStatus::Running {
            if let Some(identity) = task
                .process_identity()
                .filter(|identity| self.inner.supervisor.is_alive(*identity))
            {
                return Err(OrchestratorError::AlreadyRunning {
                    task_id,
                    pid: identity.pid,
                });
            }
            warn!(task_id, pid = ?task.process_id, "running row has no live process, repairing");
            self.repair_orphan(&task).await?;
            task = self.load_task(task_id).await?;
        }

        let snapshot = task.clone();
        let assignment = self
            .blocking(move |db| Assignment::for_task(db, &snapshot))
            .await?;
        assignment.validate(&self.inner.registry)?;
        validate_params(&task.params, &task.strategy_parameters)?;

        let user_id = task.user_id;
        let _user_guard = self.inner.user_locks.lock(user_id).await;
        let running = self
            .blocking(move |db| db.count_running_for_user(user_id))
            .await?;
        if running >= assignment.user.max_tasks {
            return Err(OrchestratorError::QuotaExceeded {
                user_id,
                running,
                max_tasks: assignment.user.max_tasks,
            });
        }

        let restart = task.status != TaskStatus::Created;
        if restart {
            TaskStateMachine::next(task.status, &TaskAction::Restart)?;
        }

        let credentials = self
            .inner
            .vault
            .decrypt_credentials(&assignment.wallet)
            .map_err(|err| OrchestratorError::ResourceAllocation {
                task_id,
                reason: err.to_string(),
            })?;
        debug!(task_id, wallet_type = %credentials.wallet_type(), "wallet credentials verified");
        drop(credentials);

        let egress = self.inner.proxies.allocate(task_id).await;
        let proxy_session = egress.as_ref().and_then(|egress| egress.session_id.clone());

        // The previous run's row is only cleared once nothing before spawn can fail.
        if restart {
            let previous = task.status;
            let reset = self
                .blocking(move |db| db.reset_run_statistics(task_id))
                .await
                .and_then(|reset| {
                    if reset {
                        Ok(())
                    } else {
                        Err(anyhow!("task {task_id} changed status before it could be reset").into())
                    }
                });
            if let Err(err) = reset {
                self.inner.proxies.release(task_id).await;
                return Err(err);
            }
            info!(task_id, %previous, "terminal task re-entered created");
        }

        let handle = match self.inner.supervisor.spawn(task_id).await {
            Ok(handle) => handle,
            Err(source) => {
                self.inner.proxies.release(task_id).await;
                self.record_spawn_failure(task_id, source.to_string()).await;
                return Err(OrchestratorError::ProcessFailure { task_id, source });
            }
        };
        let identity = handle.identity;

        if let Err(err) = self
            .record_launch(task_id, identity, proxy_session.clone())
            .await
        {
            warn!(task_id, pid = identity.pid, error = %err, "launch not recorded, terminating unit");
            if let Err(term_err) = self
                .inner
                .supervisor
                .terminate(task_id, identity, self.inner.supervisor.grace_period())
                .await
            {
                error!(task_id, pid = identity.pid, error = %term_err, "failed to terminate unrecorded unit");
            }
            self.inner.supervisor.forget(task_id, identity).await;
            self.inner.proxies.release(task_id).await;
            return Err(err);
        }

        let wallet_id = assignment.wallet.id;
        if let Err(err) = self
            .blocking(move |db| db.touch_wallet_last_used(wallet_id))
            .await
        {
            debug!(task_id, wallet_id, error = %err, "failed to touch wallet");
        }

        let tier = egress.as_ref().map(|egress| egress.tier);
        info!(task_id, pid = identity.pid, ?tier, "task started");
        self.watch(handle);

        Ok(StartedTask {
            task_id,
            identity,
            egress: tier,
            proxy_session,
        })
    }

    async fn record_launch(
        &self,
        task_id: TaskId,
        identity: ProcessIdentity,
        proxy_session: Option<String>,
    ) -> OrchestratorResult<()> {
        let next = TaskStateMachine::next(TaskStatus::Created, &TaskAction::Launch)?;
        let update = StatusUpdate::started(identity, proxy_session);
        let moved = self
            .blocking(move |db| {
                db.compare_and_set_status(task_id, TaskStatus::Created, next, &update)
            })
            .await?;
        if !moved {
            return Err(anyhow!("task {task_id} left created while starting").into());
        }
        Ok(())
    }

    async fn record_spawn_failure(&self, task_id: TaskId, message: String) {
        error!(task_id, error = %message, "failed to spawn execution unit");
        let next = match TaskStateMachine::next(
            TaskStatus::Created,
            &TaskAction::Fail(message.clone()),
        ) {
            Ok(next) => next,
            Err(err) => {
                error!(task_id, error = %err, "no transition for spawn failure");
                return;
            }
        };
        let update = StatusUpdate::finished(ErrorUpdate::Set(message));
        if let Err(err) = self
            .blocking(move |db| {
                db.compare_and_set_status(task_id, TaskStatus::Created, next, &update)
            })
            .await
        {
            error!(task_id, error = %err, "failed to record spawn failure");
        }
    }

    /// Stop a running task. Stopping a task that is not running succeeds without effect.
    ///
    /// The row only leaves `running` once its process is gone. When the process outlives
    /// the kill timeout the error is returned and the row stays `running`; the exit
    /// watcher (or the next bootstrap reconciliation) finalizes it.
    pub async fn stop(&self, task_id: TaskId) -> OrchestratorResult<()> {
        let _guard = self.lock_task(task_id).await;
        let task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Running {
            debug!(task_id, status = %task.status, "stop: task not running");
            return Ok(());
        }

        if let Some(identity) = task.process_identity() {
            if let Err(source) = self
                .inner
                .supervisor
                .terminate(task_id, identity, self.inner.supervisor.grace_period())
                .await
            {
                if self.inner.supervisor.is_alive(identity) {
                    error!(task_id, pid = identity.pid, error = %source, "execution unit survived stop");
                    return Err(OrchestratorError::ProcessFailure { task_id, source });
                }
                warn!(task_id, pid = identity.pid, error = %source, "exit not observed in time, process is gone");
            }
            self.inner.supervisor.forget(task_id, identity).await;
        }

        let next = TaskStateMachine::next(TaskStatus::Running, &TaskAction::Stop)?;
        self.blocking(move |db| {
            db.compare_and_set_status(
                task_id,
                TaskStatus::Running,
                next,
                &StatusUpdate::finished(ErrorUpdate::Keep),
            )
        })
        .await?;
        self.inner.proxies.release(task_id).await;
        info!(task_id, "task stopped");
        Ok(())
    }

    pub async fn summary(&self, task_id: TaskId) -> OrchestratorResult<TaskSummary> {
        Ok(TaskSummary::from_task(&self.load_task(task_id).await?))
    }

    /// Task ids with a process in the supervisor arena.
    pub async fn supervised_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .inner
            .supervisor
            .live_handles()
            .await
            .iter()
            .map(|handle| handle.task_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn watch(&self, mut handle: ProcessHandle) {
        let orchestrator = self.clone();
        self.inner.watchers.spawn(async move {
            let outcome = handle.wait_exit().await;
            if let Err(err) = orchestrator
                .on_exit(handle.task_id, handle.identity, outcome)
                .await
            {
                error!(task_id = handle.task_id, error = %err, "failed to finalize exited task");
            }
        });
    }

    async fn on_exit(
        &self,
        task_id: TaskId,
        identity: ProcessIdentity,
        outcome: ExitOutcome,
    ) -> OrchestratorResult<()> {
        let _guard = self.lock_task(task_id).await;
        self.inner.supervisor.forget(task_id, identity).await;

        let Some(task) = self.blocking(move |db| db.get_task(task_id)).await? else {
            self.inner.proxies.release(task_id).await;
            return Ok(());
        };
        if task.status != TaskStatus::Running || task.process_identity() != Some(identity) {
            debug!(task_id, status = %task.status, outcome = %outcome.describe(), "exit already finalized");
            if task.status != TaskStatus::Running {
                self.inner.proxies.release(task_id).await;
            }
            return Ok(());
        }

        let action = classify_exit(&task, outcome);
        let next = TaskStateMachine::next(TaskStatus::Running, &action)?;
        let error = match (&action, &task.last_error) {
            (TaskAction::Fail(reason), None) => ErrorUpdate::Set(reason.clone()),
            _ => ErrorUpdate::Keep,
        };
        let update = StatusUpdate::finished(error);
        let moved = self
            .blocking(move |db| {
                db.compare_and_set_status(task_id, TaskStatus::Running, next, &update)
            })
            .await?;
        self.inner.proxies.release(task_id).await;

        if moved {
            info!(
                task_id,
                pid = identity.pid,
                status = %next,
                outcome = %outcome.describe(),
                rounds = task.stats.recorded_rounds(),
                "task finished"
            );
        }
        Ok(())
    }

    /// Move a `running` row without a live process to `stopped`, noting the cleanup.
    pub(crate) async fn repair_orphan(&self, task: &Task) -> OrchestratorResult<bool> {
        let task_id = task.id;
        let at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let note = match task.process_id {
            Some(pid) => format!("orphan cleanup: process {pid} not alive at {at}"),
            None => format!("orphan cleanup: no process recorded at {at}"),
        };
        let next = TaskStateMachine::next(TaskStatus::Running, &TaskAction::Orphaned)?;
        let update = StatusUpdate::finished(ErrorUpdate::Append(note));
        let repaired = self
            .blocking(move |db| {
                db.compare_and_set_status(task_id, TaskStatus::Running, next, &update)
            })
            .await?;

        if let Some(identity) = task.process_identity() {
            self.inner.supervisor.forget(task_id, identity).await;
        }
        self.inner.proxies.release(task_id).await;
        if repaired {
            warn!(task_id, pid = ?task.process_id, "repaired orphaned task");
        }
        Ok(repaired)
    }

    /// Resolve once every watched process has exited and been finalized.
    pub async fn wait_idle(&self) {
        self.inner.watchers.close();
        self.inner.watchers.wait().await;
    }

    /// Stop every supervised task, then wait (bounded) for their finalization.
    pub async fn shutdown_and_wait(&self) -> OrchestratorResult<()> {
        for task_id in self.supervised_tasks().await {
            if let Err(err) = self.stop(task_id).await {
                warn!(task_id, error = %err, "failed to stop task during shutdown");
            }
        }

        self.inner.watchers.close();
        if timeout(SHUTDOWN_TIMEOUT, self.inner.watchers.wait())
            .await
            .is_err()
        {
            return Err(anyhow!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}").into());
        }
        info!("all supervised tasks finalized");
        Ok(())
    }
}

/// Terminal action for a process that exited while its row was still `running`.
pub(crate) fn classify_exit(task: &Task, outcome: ExitOutcome) -> TaskAction {
    let finished_cleanly = task.rounds_exhausted() && task.last_error.is_none();
    match outcome {
        ExitOutcome::Normal | ExitOutcome::Unobserved if finished_cleanly => TaskAction::Complete,
        ExitOutcome::Normal => TaskAction::Fail(task.last_error.clone().unwrap_or_else(|| {
            format!(
                "exited after {} of {} rounds",
                task.stats.recorded_rounds(),
                task.params.rounds
            )
        })),
        other => TaskAction::Fail(
            task.last_error
                .clone()
                .unwrap_or_else(|| other.describe()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aster_auto_core::types::{OrderType, Side, TaskParams, TaskStats};
    use rust_decimal::Decimal;

    fn task(rounds: u32, recorded: u32, last_error: Option<&str>) -> Task {
        let now = Utc::now();
        Task {
            id: 1,
            user_id: 1,
            wallet_id: 1,
            strategy_id: 1,
            name: "t".to_string(),
            description: None,
            params: TaskParams {
                symbol: "BTC-USD".to_string(),
                quantity: Decimal::ONE,
                interval_secs: 1,
                rounds,
                leverage: 1,
                side: Side::Buy,
                order_type: OrderType::Market,
            },
            strategy_parameters: serde_json::json!({}),
            status: TaskStatus::Running,
            process_id: Some(42),
            process_started_at: Some(1),
            proxy_session: None,
            start_time: Some(now),
            end_time: None,
            last_error: last_error.map(str::to_string),
            stats: TaskStats {
                total_rounds: recorded,
                successful_rounds: recorded,
                ..TaskStats::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_normal_exit_with_all_rounds_completes() {
        assert_eq!(
            classify_exit(&task(3, 3, None), ExitOutcome::Normal),
            TaskAction::Complete
        );
        assert_eq!(
            classify_exit(&task(3, 3, None), ExitOutcome::Unobserved),
            TaskAction::Complete
        );
    }

    #[test]
    fn test_normal_exit_short_of_rounds_fails() {
        assert_eq!(
            classify_exit(&task(5, 2, None), ExitOutcome::Normal),
            TaskAction::Fail("exited after 2 of 5 rounds".to_string())
        );
    }

    #[test]
    fn test_recorded_error_wins_over_exit_description() {
        assert_eq!(
            classify_exit(&task(3, 1, Some("fatal: auth")), ExitOutcome::Crashed { code: 1 }),
            TaskAction::Fail("fatal: auth".to_string())
        );
        assert_eq!(
            classify_exit(&task(3, 3, Some("late")), ExitOutcome::Normal),
            TaskAction::Fail("late".to_string())
        );
    }

    #[test]
    fn test_signal_exit_is_failure_even_when_rounds_done() {
        assert_eq!(
            classify_exit(&task(2, 2, None), ExitOutcome::Killed { signal: 9 }),
            TaskAction::Fail("killed by signal 9".to_string())
        );
        assert_eq!(
            classify_exit(&task(2, 1, None), ExitOutcome::Unobserved),
            TaskAction::Fail("exited while unsupervised".to_string())
        );
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let guard = locks.lock(7).await;

        let other = locks.lock(8).await;
        drop(other);

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(7).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
