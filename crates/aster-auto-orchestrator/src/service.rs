/*
[INPUT]:  Database handle, StrategyRegistry, task creation/update requests
[OUTPUT]: Validated task rows, TaskSummary reports, masked wallet views
[POS]:    Service layer - every check that runs before a task may be started
[UPDATE]: When task parameters, ownership rules or compatibility rules change
*/

use aster_auto_core::types::{
    MaskedWallet, NewTask, Strategy, StrategyId, Task, TaskId, TaskParams, TaskStats, TaskStatus,
    User, UserId, Wallet, WalletId,
};
use aster_auto_core::{CredentialVault, Database};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{OrchestratorError, OrchestratorResult, ValidationError};
use crate::strategy::StrategyRegistry;

/// The three rows a task points at, loaded together for validation.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub user: User,
    pub wallet: Wallet,
    pub strategy: Strategy,
}

impl Assignment {
    pub fn load(
        db: &Database,
        user_id: UserId,
        wallet_id: WalletId,
        strategy_id: StrategyId,
    ) -> OrchestratorResult<Self> {
        let user = db
            .get_user(user_id)?
            .ok_or_else(|| OrchestratorError::not_found("user", user_id))?;
        let wallet = db
            .get_wallet(wallet_id)?
            .ok_or_else(|| OrchestratorError::not_found("wallet", wallet_id))?;
        let strategy = db
            .get_strategy(strategy_id)?
            .ok_or_else(|| OrchestratorError::not_found("strategy", strategy_id))?;
        Ok(Self {
            user,
            wallet,
            strategy,
        })
    }

    pub fn for_task(db: &Database, task: &Task) -> OrchestratorResult<Self> {
        Self::load(db, task.user_id, task.wallet_id, task.strategy_id)
    }

    /// Ownership, activity flags, registration and wallet/strategy compatibility.
    pub fn validate(&self, registry: &StrategyRegistry) -> Result<(), ValidationError> {
        if !self.user.is_active {
            return Err(ValidationError::InactiveUser(self.user.id));
        }
        if self.wallet.user_id != self.user.id {
            return Err(ValidationError::WalletNotOwned {
                wallet_id: self.wallet.id,
                user_id: self.user.id,
            });
        }
        if !self.wallet.is_active {
            return Err(ValidationError::InactiveWallet(self.wallet.id));
        }
        if !self.strategy.is_active {
            return Err(ValidationError::InactiveStrategy(self.strategy.id));
        }

        let tag = &self.strategy.strategy_type;
        let registered = registry
            .supports(tag, self.wallet.wallet_type)
            .ok_or_else(|| ValidationError::StrategyNotRegistered(tag.clone()))?;
        if !registered || !self.strategy.supports(self.wallet.wallet_type) {
            return Err(ValidationError::WalletStrategyMismatch {
                wallet_type: self.wallet.wallet_type,
                strategy: self.strategy.name.clone(),
            });
        }
        Ok(())
    }
}

pub fn validate_params(
    params: &TaskParams,
    strategy_parameters: &serde_json::Value,
) -> Result<(), ValidationError> {
    let invalid = |field: &'static str, reason: &str| ValidationError::InvalidParameter {
        field,
        reason: reason.to_string(),
    };

    if params.symbol.trim().is_empty() {
        return Err(invalid("symbol", "must not be empty"));
    }
    if params.quantity <= Decimal::ZERO {
        return Err(invalid("quantity", "must be greater than zero"));
    }
    if params.interval_secs == 0 {
        return Err(invalid("interval", "must be greater than zero"));
    }
    if params.rounds == 0 {
        return Err(invalid("rounds", "must be greater than zero"));
    }
    if params.leverage == 0 {
        return Err(invalid("leverage", "must be at least 1"));
    }
    if !strategy_parameters.is_object() {
        return Err(invalid("strategy_parameters", "must be a JSON object"));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::InvalidParameter {
            field: "name",
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub name: String,
    pub description: Option<String>,
    pub params: TaskParams,
    pub strategy_parameters: serde_json::Value,
}

/// Point-in-time report of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub process_id: Option<u32>,
    pub proxy_session: Option<String>,
    pub rounds: u32,
    pub stats: TaskStats,
    pub success_rate: f64,
    pub duration_secs: Option<i64>,
    pub last_error: Option<String>,
}

impl TaskSummary {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            status: task.status,
            process_id: task.process_id,
            proxy_session: task.proxy_session.clone(),
            rounds: task.params.rounds,
            stats: task.stats.clone(),
            success_rate: task.success_rate(),
            duration_secs: task.duration(Utc::now()).map(|d| d.num_seconds()),
            last_error: task.last_error.clone(),
        }
    }
}

/// CRUD entry point for tasks. Nothing here touches processes.
#[derive(Debug, Clone)]
pub struct TaskService {
    db: Database,
    registry: Arc<StrategyRegistry>,
}

impl TaskService {
    pub fn new(db: Database, registry: Arc<StrategyRegistry>) -> Self {
        Self { db, registry }
    }

    pub fn create_task(&self, task: &NewTask) -> OrchestratorResult<TaskId> {
        validate_name(&task.name)?;
        validate_params(&task.params, &task.strategy_parameters)?;
        Assignment::load(&self.db, task.user_id, task.wallet_id, task.strategy_id)?
            .validate(&self.registry)?;
        if self.db.task_name_exists(task.user_id, &task.name, None)? {
            return Err(ValidationError::DuplicateName(task.name.clone()).into());
        }

        let task_id = self.db.create_task(task)?;
        info!(task_id, user_id = task.user_id, name = %task.name, "task created");
        Ok(task_id)
    }

    pub fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> OrchestratorResult<()> {
        let task = self.get_task(task_id)?;
        if task.status == TaskStatus::Running {
            return Err(ValidationError::TaskRunning(task_id).into());
        }
        validate_name(&update.name)?;
        validate_params(&update.params, &update.strategy_parameters)?;
        if self
            .db
            .task_name_exists(task.user_id, &update.name, Some(task_id))?
        {
            return Err(ValidationError::DuplicateName(update.name.clone()).into());
        }

        let updated = self.db.update_task_parameters(
            task_id,
            &update.name,
            update.description.as_deref(),
            &update.params,
            &update.strategy_parameters,
        )?;
        if !updated {
            // started between the read and the write
            return Err(ValidationError::TaskRunning(task_id).into());
        }
        Ok(())
    }

    pub fn delete_task(&self, task_id: TaskId) -> OrchestratorResult<()> {
        let task = self.get_task(task_id)?;
        if task.status == TaskStatus::Running || !self.db.delete_task(task_id)? {
            return Err(ValidationError::TaskRunning(task_id).into());
        }
        info!(task_id, "task deleted");
        Ok(())
    }

    pub fn get_task(&self, task_id: TaskId) -> OrchestratorResult<Task> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| OrchestratorError::not_found("task", task_id))
    }

    pub fn summary(&self, task_id: TaskId) -> OrchestratorResult<TaskSummary> {
        Ok(TaskSummary::from_task(&self.get_task(task_id)?))
    }

    pub fn list_summaries(&self, user_id: Option<UserId>) -> OrchestratorResult<Vec<TaskSummary>> {
        let tasks = match user_id {
            Some(user_id) => self.db.list_tasks_for_user(user_id)?,
            None => self.db.list_tasks()?,
        };
        Ok(tasks.iter().map(TaskSummary::from_task).collect())
    }

    pub fn masked_wallets(
        &self,
        vault: &CredentialVault,
        user_id: UserId,
    ) -> OrchestratorResult<Vec<MaskedWallet>> {
        Ok(self
            .db
            .list_wallets_for_user(user_id)?
            .iter()
            .map(|wallet| vault.mask(wallet))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aster_auto_core::types::{OrderType, Side};
    use rstest::rstest;

    fn params() -> TaskParams {
        TaskParams {
            symbol: "ETH-USD".to_string(),
            quantity: Decimal::new(5, 2),
            interval_secs: 10,
            rounds: 4,
            leverage: 1,
            side: Side::Both,
            order_type: OrderType::Limit,
        }
    }

    #[test]
    fn test_valid_params_pass() {
        assert!(validate_params(&params(), &serde_json::json!({"fail_rounds": [2]})).is_ok());
    }

    #[rstest]
    #[case::empty_symbol("symbol")]
    #[case::zero_quantity("quantity")]
    #[case::zero_interval("interval")]
    #[case::zero_rounds("rounds")]
    #[case::zero_leverage("leverage")]
    fn test_invalid_params_name_the_field(#[case] field: &'static str) {
        let mut p = params();
        match field {
            "symbol" => p.symbol = "  ".to_string(),
            "quantity" => p.quantity = Decimal::ZERO,
            "interval" => p.interval_secs = 0,
            "rounds" => p.rounds = 0,
            _ => p.leverage = 0,
        }
        match validate_params(&p, &serde_json::json!({})) {
            Err(ValidationError::InvalidParameter { field: got, .. }) => assert_eq!(got, field),
            other => panic!("expected InvalidParameter, got {other:?}"),
        }
    }

    #[test]
    fn test_strategy_parameters_must_be_object() {
        let err = validate_params(&params(), &serde_json::json!([1, 2])).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidParameter {
                field: "strategy_parameters",
                ..
            }
        ));
    }

    #[test]
    fn test_blank_name_rejected() {
        assert!(validate_name("").is_err());
        assert!(validate_name("grid-1").is_ok());
    }
}
