/*
[INPUT]:  Public API exports for aster-auto-orchestrator
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point shared by the binary and integration tests
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod proxy;
pub mod reconciler;
pub mod runner;
pub mod service;
pub mod state_machine;
pub mod strategy;
pub mod supervisor;

// Re-export main types for convenience
pub use config::AppConfig;
pub use error::{ErrorKind, OrchestratorError, OrchestratorResult, ValidationError};
pub use orchestrator::{OrchestratorParts, StartedTask, TaskOrchestrator};
pub use proxy::{EgressIdentity, EgressTier, ProxySessionAllocator};
pub use reconciler::ReconcileReport;
pub use runner::{RunOutcome, TaskRunner};
pub use service::{TaskService, TaskSummary};
pub use strategy::StrategyRegistry;
pub use supervisor::{ExitOutcome, ProcessSupervisor, RunnerCommand};
