/*
[INPUT]:  Tasks persisted as `running`, OS process table
[OUTPUT]: Orphans moved to `stopped`, surviving units adopted, ReconcileReport
[POS]:    Startup layer - runs once inside TaskOrchestrator::bootstrap
[UPDATE]: When orphan detection or adoption rules change
*/

use aster_auto_core::types::{ProcessIdentity, Task, TaskId, TaskStatus};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::OrchestratorResult;
use crate::orchestrator::TaskOrchestrator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub repaired: Vec<TaskId>,
    pub adopted: Vec<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Adopt(ProcessIdentity),
    Repair,
}

fn verdict(task: &Task, alive: impl Fn(ProcessIdentity) -> bool) -> Verdict {
    match task.process_identity() {
        Some(identity) if alive(identity) => Verdict::Adopt(identity),
        _ => Verdict::Repair,
    }
}

pub struct OrphanReconciler<'a> {
    orchestrator: &'a TaskOrchestrator,
}

impl<'a> OrphanReconciler<'a> {
    pub(crate) fn new(orchestrator: &'a TaskOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub(crate) async fn run(&self) -> OrchestratorResult<ReconcileReport> {
        let running = self
            .orchestrator
            .blocking(|db| db.list_tasks_by_status(TaskStatus::Running))
            .await?;

        let mut report = ReconcileReport {
            examined: running.len(),
            ..ReconcileReport::default()
        };
        let supervisor = self.orchestrator.supervisor();

        for task in running {
            let _guard = self.orchestrator.lock_task(task.id).await;
            match verdict(&task, |identity| supervisor.is_alive(identity)) {
                Verdict::Adopt(identity) => {
                    let handle = supervisor.adopt(task.id, identity).await;
                    self.orchestrator.watch(handle);
                    report.adopted.push(task.id);
                }
                Verdict::Repair => {
                    if self.orchestrator.repair_orphan(&task).await? {
                        report.repaired.push(task.id);
                    } else {
                        debug!(task_id = task.id, "task left running before repair");
                    }
                }
            }
        }

        info!(
            examined = report.examined,
            repaired = report.repaired.len(),
            adopted = report.adopted.len(),
            "reconciliation complete"
        );
        Ok(report)
    }
}
