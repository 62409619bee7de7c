/*
[INPUT]:  RunnerCommand (program + args), task ids, ProcessIdentity rows from the store
[OUTPUT]: One OS process per task, liveness checks, cooperative-then-forced termination
[POS]:    Process layer - the only code that spawns, signals or reaps execution units
[UPDATE]: When changing spawn isolation, signal escalation or exit classification
*/

use aster_auto_core::types::{ProcessIdentity, TaskId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{CONFIG_ENV, SupervisorConfig};

/// Allowed drift between the recorded and the observed process start time.
const START_TIME_TOLERANCE_SECS: u64 = 2;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn execution unit for task {task_id}: {source}")]
    Spawn {
        task_id: TaskId,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to deliver {signal} to pid {pid}")]
    Signal { pid: u32, signal: String },

    #[error("pid {pid} still alive after {waited:?}")]
    Timeout { pid: u32, waited: Duration },
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Normal,
    Killed { signal: i32 },
    Crashed { code: i32 },
    /// The process was adopted after a restart, so its exit status is unknown.
    Unobserved,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => ExitOutcome::Normal,
            Some(code) => ExitOutcome::Crashed { code },
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return ExitOutcome::Killed { signal };
                    }
                }
                ExitOutcome::Crashed { code: -1 }
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExitOutcome::Normal => "exited normally".to_string(),
            ExitOutcome::Killed { signal } => format!("killed by signal {signal}"),
            ExitOutcome::Crashed { code } => format!("exited with code {code}"),
            ExitOutcome::Unobserved => "exited while unsupervised".to_string(),
        }
    }
}

pub type ExitWatch = watch::Receiver<Option<ExitOutcome>>;

/// Execution unit invocation; the task id is appended as the last argument.
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl RunnerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Build the command from config; only the config path crosses the spawn boundary.
    pub fn from_config(config: &SupervisorConfig, config_path: &Path) -> std::io::Result<Self> {
        let program = match &config.runner_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let config_path = std::path::absolute(config_path)?;
        Ok(Self {
            program,
            args: config.runner_args.clone(),
            envs: vec![(
                CONFIG_ENV.to_string(),
                config_path.to_string_lossy().into_owned(),
            )],
        })
    }
}

/// A live (or recently live) execution unit.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub task_id: TaskId,
    pub identity: ProcessIdentity,
    exit: ExitWatch,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.identity.pid
    }

    /// Resolve once the process has exited.
    pub async fn wait_exit(&mut self) -> ExitOutcome {
        match self.exit.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(ExitOutcome::Unobserved),
            Err(_) => ExitOutcome::Unobserved,
        }
    }
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    command: RunnerCommand,
    grace_period: Duration,
    kill_timeout: Duration,
    poll_interval: Duration,
    arena: Mutex<HashMap<TaskId, ProcessHandle>>,
}

impl ProcessSupervisor {
    pub fn new(command: RunnerCommand, grace_period: Duration, kill_timeout: Duration) -> Self {
        Self {
            command,
            grace_period,
            kill_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            arena: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Launch the execution unit for `task_id` in its own process group.
    pub async fn spawn(&self, task_id: TaskId) -> Result<ProcessHandle, SupervisorError> {
        let mut command = tokio::process::Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .arg(task_id.to_string())
            .envs(self.command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| SupervisorError::Spawn { task_id, source })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            task_id,
            source: std::io::Error::other("child exited before its pid was read"),
        })?;
        let started_at = process_start_time(pid).unwrap_or_else(unix_now);
        let identity = ProcessIdentity { pid, started_at };

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::from_status(status),
                Err(err) => {
                    warn!(task_id, pid, error = %err, "failed to wait on execution unit");
                    ExitOutcome::Unobserved
                }
            };
            debug!(task_id, pid, outcome = %outcome.describe(), "execution unit exited");
            let _ = tx.send(Some(outcome));
        });

        info!(task_id, pid, "execution unit spawned");
        let handle = ProcessHandle {
            task_id,
            identity,
            exit: rx,
        };
        self.arena.lock().await.insert(task_id, handle.clone());
        Ok(handle)
    }

    /// Track a process this supervisor did not spawn. Its exit is detected by polling.
    pub async fn adopt(&self, task_id: TaskId, identity: ProcessIdentity) -> ProcessHandle {
        let (tx, rx) = watch::channel(None);
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            loop {
                sleep(poll_interval).await;
                if !process_alive(identity) {
                    debug!(task_id, pid = identity.pid, "adopted execution unit is gone");
                    let _ = tx.send(Some(ExitOutcome::Unobserved));
                    break;
                }
            }
        });

        info!(task_id, pid = identity.pid, "adopted surviving execution unit");
        let handle = ProcessHandle {
            task_id,
            identity,
            exit: rx,
        };
        self.arena.lock().await.insert(task_id, handle.clone());
        handle
    }

    pub fn is_alive(&self, identity: ProcessIdentity) -> bool {
        process_alive(identity)
    }

    pub async fn handle(&self, task_id: TaskId) -> Option<ProcessHandle> {
        self.arena.lock().await.get(&task_id).cloned()
    }

    pub async fn live_handles(&self) -> Vec<ProcessHandle> {
        self.arena.lock().await.values().cloned().collect()
    }

    /// Drop the arena entry for `task_id` if it still refers to `identity`.
    pub async fn forget(&self, task_id: TaskId, identity: ProcessIdentity) {
        let mut arena = self.arena.lock().await;
        if arena
            .get(&task_id)
            .is_some_and(|handle| handle.identity == identity)
        {
            arena.remove(&task_id);
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Terminating a dead process is a no-op.
    pub async fn terminate(
        &self,
        task_id: TaskId,
        identity: ProcessIdentity,
        grace: Duration,
    ) -> Result<(), SupervisorError> {
        if !process_alive(identity) {
            debug!(task_id, pid = identity.pid, "terminate: process already gone");
            return Ok(());
        }

        send_signal(identity, Signal::Term)?;
        if self.wait_gone(task_id, identity, grace).await {
            info!(task_id, pid = identity.pid, "execution unit stopped gracefully");
            return Ok(());
        }

        warn!(task_id, pid = identity.pid, ?grace, "grace period elapsed, killing");
        send_signal(identity, Signal::Kill)?;
        if self.wait_gone(task_id, identity, self.kill_timeout).await {
            return Ok(());
        }

        Err(SupervisorError::Timeout {
            pid: identity.pid,
            waited: grace + self.kill_timeout,
        })
    }

    async fn wait_gone(&self, task_id: TaskId, identity: ProcessIdentity, within: Duration) -> bool {
        let exit = self
            .arena
            .lock()
            .await
            .get(&task_id)
            .filter(|handle| handle.identity == identity)
            .map(|handle| handle.exit.clone());

        if let Some(mut exit) = exit {
            return timeout(within, exit.wait_for(Option::is_some)).await.is_ok();
        }

        let deadline = Instant::now() + within;
        loop {
            if !process_alive(identity) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.poll_interval).await;
        }
    }
}

/// True when `identity.pid` exists, is not a zombie and started when recorded.
pub fn process_alive(identity: ProcessIdentity) -> bool {
    let pid = Pid::from_u32(identity.pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    match system.process(pid) {
        None => false,
        Some(process) => {
            if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
                return false;
            }
            process.start_time().abs_diff(identity.started_at) <= START_TIME_TOLERANCE_SECS
        }
    }
}

/// Start time of `pid` in seconds since the epoch, as the OS reports it.
pub fn process_start_time(pid: u32) -> Option<u64> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.start_time())
}

fn send_signal(identity: ProcessIdentity, signal: Signal) -> Result<(), SupervisorError> {
    let pid = Pid::from_u32(identity.pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    let Some(process) = system.process(pid) else {
        return Ok(());
    };
    if process.start_time().abs_diff(identity.started_at) > START_TIME_TOLERANCE_SECS {
        // PID now belongs to someone else.
        return Ok(());
    }

    match process.kill_with(signal) {
        Some(true) => Ok(()),
        Some(false) if !process_alive(identity) => Ok(()),
        _ => Err(SupervisorError::Signal {
            pid: identity.pid,
            signal: format!("{signal:?}"),
        }),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
