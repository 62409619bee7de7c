/*
[INPUT]:  Current TaskStatus, TaskAction requested by orchestrator or reconciler
[OUTPUT]: Target TaskStatus for a compare-and-set, or StateError
[POS]:    Task domain logic - legal lifecycle transitions
[UPDATE]: When task status transitions change
*/

use aster_auto_core::types::TaskStatus;
use thiserror::Error;

/// Actions that can trigger task state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Re-enter validation from a terminal state.
    Restart,
    /// A process handle was obtained.
    Launch,
    /// User-requested stop.
    Stop,
    /// Normal exit with every round recorded.
    Complete,
    Fail(String),
    /// Process vanished without a recorded exit.
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid transition: {from} -> {action:?}")]
    InvalidTransition {
        from: TaskStatus,
        action: TaskAction,
    },
}

/// State machine managing task lifecycle transitions
#[derive(Debug, Clone, Copy)]
pub struct TaskStateMachine {
    current_state: TaskStatus,
}

impl TaskStateMachine {
    pub fn new(initial: TaskStatus) -> Self {
        Self {
            current_state: initial,
        }
    }

    /// Target state for `action` from `from`, without mutating anything.
    pub fn next(from: TaskStatus, action: &TaskAction) -> Result<TaskStatus, StateError> {
        let next = match (from, action) {
            (status, TaskAction::Restart) if status.is_terminal() => TaskStatus::Created,
            (TaskStatus::Created, TaskAction::Launch) => TaskStatus::Running,
            // spawn failed before a handle existed
            (TaskStatus::Created, TaskAction::Fail(_)) => TaskStatus::Error,
            (TaskStatus::Running, TaskAction::Stop) => TaskStatus::Stopped,
            (TaskStatus::Running, TaskAction::Complete) => TaskStatus::Completed,
            (TaskStatus::Running, TaskAction::Fail(_)) => TaskStatus::Error,
            (TaskStatus::Running, TaskAction::Orphaned) => TaskStatus::Stopped,
            _ => {
                return Err(StateError::InvalidTransition {
                    from,
                    action: action.clone(),
                });
            }
        };
        Ok(next)
    }

    pub fn can_transition(&self, action: &TaskAction) -> bool {
        Self::next(self.current_state, action).is_ok()
    }

    pub fn transition(&mut self, action: TaskAction) -> Result<TaskStatus, StateError> {
        self.current_state = Self::next(self.current_state, &action)?;
        Ok(self.current_state)
    }

    pub fn state(&self) -> TaskStatus {
        self.current_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut machine = TaskStateMachine::new(TaskStatus::Created);
        assert_eq!(machine.transition(TaskAction::Launch), Ok(TaskStatus::Running));
        assert_eq!(machine.transition(TaskAction::Complete), Ok(TaskStatus::Completed));
        assert_eq!(machine.transition(TaskAction::Restart), Ok(TaskStatus::Created));
        assert_eq!(machine.transition(TaskAction::Launch), Ok(TaskStatus::Running));
        assert_eq!(
            machine.transition(TaskAction::Fail("boom".to_string())),
            Ok(TaskStatus::Error)
        );
    }

    #[test]
    fn test_running_is_left_exactly_once() {
        for action in [
            TaskAction::Stop,
            TaskAction::Complete,
            TaskAction::Fail("x".to_string()),
            TaskAction::Orphaned,
        ] {
            let mut machine = TaskStateMachine::new(TaskStatus::Running);
            let terminal = machine.transition(action.clone()).unwrap();
            assert!(terminal.is_terminal());
            assert!(!machine.can_transition(&action));
            assert!(!machine.can_transition(&TaskAction::Launch));
        }
    }

    #[test]
    fn test_terminal_states_restart_through_created() {
        for status in [TaskStatus::Stopped, TaskStatus::Completed, TaskStatus::Error] {
            assert!(TaskStateMachine::next(status, &TaskAction::Launch).is_err());
            assert_eq!(
                TaskStateMachine::next(status, &TaskAction::Restart),
                Ok(TaskStatus::Created)
            );
        }
    }

    #[test]
    fn test_invalid_transition_reports_source() {
        let err = TaskStateMachine::next(TaskStatus::Created, &TaskAction::Stop).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: TaskStatus::Created,
                action: TaskAction::Stop,
            }
        );
        assert!(TaskStateMachine::next(TaskStatus::Running, &TaskAction::Restart).is_err());
        assert_eq!(
            TaskStateMachine::next(TaskStatus::Created, &TaskAction::Fail("spawn".to_string())),
            Ok(TaskStatus::Error)
        );
    }
}
