/*
[INPUT]:  tasks table rows, StatusUpdate/StatDelta from orchestrator and execution units.
[OUTPUT]: Task CRUD, compare-and-set status transitions and atomic statistic appends.
[POS]:    Persistence layer - the single source of truth for task lifecycle state.
[UPDATE]: When task columns, transition side effects or statistics fields change.
*/

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};
use rust_decimal::Decimal;
use std::str::FromStr;

use super::Database;
use crate::types::{
    ErrorUpdate, NewTask, OrderType, Side, StatDelta, StatusUpdate, Task, TaskId, TaskParams,
    TaskStats, TaskStatus, UserId,
};

const TASK_COLUMNS: &str = "id, user_id, wallet_id, strategy_id, name, description, symbol, \
     quantity, interval_secs, rounds, leverage, side, order_type, strategy_parameters, status, \
     process_id, process_started_at, proxy_session, start_time, end_time, last_error, \
     total_rounds, successful_rounds, failed_rounds, supplement_orders, total_cost_diff, \
     buy_volume_usdt, sell_volume_usdt, total_fees_usdt, initial_usdt_balance, \
     final_usdt_balance, usdt_balance_diff, net_loss_usdt, created_at, updated_at";

impl Database {
    pub fn create_task(&self, task: &NewTask) -> Result<TaskId> {
        let conn = self.conn()?;
        let strategy_parameters = serde_json::to_string(&task.strategy_parameters)
            .context("serialize strategy parameters")?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO tasks (user_id, wallet_id, strategy_id, name, description, symbol,
                quantity, interval_secs, rounds, leverage, side, order_type, strategy_parameters,
                status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'created', ?14, ?14)",
            params![
                task.user_id,
                task.wallet_id,
                task.strategy_id,
                task.name,
                task.description,
                task.params.symbol,
                task.params.quantity.to_string(),
                task.params.interval_secs,
                task.params.rounds,
                task.params.leverage,
                task.params.side.as_str(),
                task.params.order_type.as_str(),
                strategy_parameters,
                now
            ],
        )
        .with_context(|| format!("insert task {}", task.name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        let conn = self.conn()?;
        select_task(&conn, task_id)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"),
            [],
        )
    }

    pub fn list_tasks_for_user(&self, user_id: UserId) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 ORDER BY id"),
            params![user_id],
        )
    }

    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id"),
            params![status.as_str()],
        )
    }

    pub fn count_running_for_user(&self, user_id: UserId) -> Result<u32> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE user_id = ?1 AND status = 'running'",
            params![user_id],
            |row| row.get(0),
        )
        .context("count running tasks")
    }

    pub fn task_name_exists(
        &self,
        user_id: UserId,
        name: &str,
        excluding: Option<TaskId>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE user_id = ?1 AND name = ?2 AND id != ?3",
                params![user_id, name, excluding.unwrap_or(-1)],
                |row| row.get(0),
            )
            .context("check task name")?;
        Ok(count > 0)
    }

    /// Replace a task's parameters. Returns false when the task is running or missing.
    pub fn update_task_parameters(
        &self,
        task_id: TaskId,
        name: &str,
        description: Option<&str>,
        task_params: &TaskParams,
        strategy_parameters: &serde_json::Value,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let strategy_parameters =
            serde_json::to_string(strategy_parameters).context("serialize strategy parameters")?;
        let changed = conn
            .execute(
                "UPDATE tasks SET name = ?1, description = ?2, symbol = ?3, quantity = ?4,
                    interval_secs = ?5, rounds = ?6, leverage = ?7, side = ?8, order_type = ?9,
                    strategy_parameters = ?10, updated_at = ?11
                 WHERE id = ?12 AND status != 'running'",
                params![
                    name,
                    description,
                    task_params.symbol,
                    task_params.quantity.to_string(),
                    task_params.interval_secs,
                    task_params.rounds,
                    task_params.leverage,
                    task_params.side.as_str(),
                    task_params.order_type.as_str(),
                    strategy_parameters,
                    Utc::now(),
                    task_id
                ],
            )
            .context("update task parameters")?;
        Ok(changed == 1)
    }

    /// Delete a task. Returns false when the task is running or missing.
    pub fn delete_task(&self, task_id: TaskId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM tasks WHERE id = ?1 AND status != 'running'",
                params![task_id],
            )
            .context("delete task")?;
        Ok(changed == 1)
    }

    /// Move `task_id` from `expected` to `next`, applying `update` in the same transaction.
    ///
    /// Returns false without touching the row when its current status is not `expected`.
    pub fn compare_and_set_status(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        update: &StatusUpdate,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin status transaction")?;

        let current = tx
            .query_row(
                "SELECT status, last_error FROM tasks WHERE id = ?1",
                params![task_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .context("fetch task status")?;
        let Some((status, last_error)) = current else {
            return Ok(false);
        };
        if TaskStatus::from_str(&status)? != expected {
            return Ok(false);
        }

        let last_error = match &update.error {
            ErrorUpdate::Keep => last_error,
            ErrorUpdate::Clear => None,
            ErrorUpdate::Set(message) => Some(message.clone()),
            ErrorUpdate::Append(note) => Some(match last_error {
                Some(previous) if !previous.is_empty() => format!("{previous}; {note}"),
                _ => note.clone(),
            }),
        };
        let (process_id, process_started_at) = match update.process {
            Some(process) => (
                Some(process.pid),
                Some(i64::try_from(process.started_at).context("process start time overflow")?),
            ),
            None => (None, None),
        };

        tx.execute(
            "UPDATE tasks SET status = ?1, last_error = ?2, updated_at = ?3,
                process_id = CASE WHEN ?4 THEN NULL ELSE COALESCE(?5, process_id) END,
                process_started_at = CASE WHEN ?4 THEN NULL ELSE COALESCE(?6, process_started_at) END,
                proxy_session = CASE WHEN ?4 THEN NULL ELSE COALESCE(?7, proxy_session) END,
                start_time = CASE WHEN ?8 THEN ?3 ELSE start_time END,
                end_time = CASE WHEN ?9 THEN ?3 WHEN ?8 THEN NULL ELSE end_time END
             WHERE id = ?10",
            params![
                next.as_str(),
                last_error,
                Utc::now(),
                update.clear_process,
                process_id,
                process_started_at,
                update.proxy_session,
                update.stamp_start,
                update.stamp_end,
                task_id
            ],
        )
        .context("apply status transition")?;
        tx.commit().context("commit status transition")?;

        tracing::debug!(task_id, from = %expected, to = %next, "task status changed");
        Ok(true)
    }

    /// Fold one round's statistics into the row under a write lock.
    ///
    /// Fails with [`crate::types::StatError`] when the delta would record more rounds
    /// than configured; the stored totals are left unchanged in that case.
    pub fn append_stat_delta(&self, task_id: TaskId, delta: &StatDelta) -> Result<TaskStats> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin statistics transaction")?;

        let task = select_task(&tx, task_id)?.ok_or_else(|| anyhow!("task {task_id} not found"))?;
        let mut stats = task.stats;
        stats.apply(delta, task.params.rounds)?;
        write_stats(&tx, task_id, &stats)?;
        tx.commit().context("commit statistics")?;
        Ok(stats)
    }

    /// Record a failure description reported by the execution unit.
    pub fn report_error(&self, task_id: TaskId, message: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![message, Utc::now(), task_id],
        )
        .context("record task error")?;
        Ok(())
    }

    /// Return a terminal task to `created` with zeroed run statistics.
    ///
    /// Returns false when the task is not in a terminal state.
    pub fn reset_run_statistics(&self, task_id: TaskId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin reset transaction")?;

        let changed = tx
            .execute(
                "UPDATE tasks SET status = 'created', last_error = NULL, start_time = NULL,
                    end_time = NULL, process_id = NULL, process_started_at = NULL,
                    proxy_session = NULL, updated_at = ?1
                 WHERE id = ?2 AND status IN ('stopped', 'completed', 'error')",
                params![Utc::now(), task_id],
            )
            .context("reset task status")?;
        if changed == 0 {
            return Ok(false);
        }
        write_stats(&tx, task_id, &TaskStats::default())?;
        tx.commit().context("commit reset")?;
        Ok(true)
    }

    fn query_tasks<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("prepare task list")?;
        let rows = stmt
            .query_map(params, TaskRow::from_row)
            .context("query task list")?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(Task::try_from(row?)?);
        }
        Ok(tasks)
    }
}

fn select_task(conn: &rusqlite::Connection, task_id: TaskId) -> Result<Option<Task>> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id],
            TaskRow::from_row,
        )
        .optional()
        .context("fetch task")?;
    row.map(Task::try_from).transpose()
}

fn write_stats(tx: &Transaction<'_>, task_id: TaskId, stats: &TaskStats) -> Result<()> {
    tx.execute(
        "UPDATE tasks SET total_rounds = ?1, successful_rounds = ?2, failed_rounds = ?3,
            supplement_orders = ?4, total_cost_diff = ?5, buy_volume_usdt = ?6,
            sell_volume_usdt = ?7, total_fees_usdt = ?8, initial_usdt_balance = ?9,
            final_usdt_balance = ?10, usdt_balance_diff = ?11, net_loss_usdt = ?12,
            updated_at = ?13
         WHERE id = ?14",
        params![
            stats.total_rounds,
            stats.successful_rounds,
            stats.failed_rounds,
            stats.supplement_orders,
            stats.total_cost_diff.to_string(),
            stats.buy_volume_usdt.to_string(),
            stats.sell_volume_usdt.to_string(),
            stats.total_fees_usdt.to_string(),
            stats.initial_usdt_balance.map(|value| value.to_string()),
            stats.final_usdt_balance.map(|value| value.to_string()),
            stats.usdt_balance_diff.to_string(),
            stats.net_loss_usdt.to_string(),
            Utc::now(),
            task_id
        ],
    )
    .context("write task statistics")?;
    Ok(())
}

struct TaskRow {
    id: i64,
    user_id: i64,
    wallet_id: i64,
    strategy_id: i64,
    name: String,
    description: Option<String>,
    symbol: String,
    quantity: String,
    interval_secs: u32,
    rounds: u32,
    leverage: u32,
    side: String,
    order_type: String,
    strategy_parameters: String,
    status: String,
    process_id: Option<u32>,
    process_started_at: Option<i64>,
    proxy_session: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    total_rounds: u32,
    successful_rounds: u32,
    failed_rounds: u32,
    supplement_orders: u32,
    total_cost_diff: String,
    buy_volume_usdt: String,
    sell_volume_usdt: String,
    total_fees_usdt: String,
    initial_usdt_balance: Option<String>,
    final_usdt_balance: Option<String>,
    usdt_balance_diff: String,
    net_loss_usdt: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            wallet_id: row.get("wallet_id")?,
            strategy_id: row.get("strategy_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            symbol: row.get("symbol")?,
            quantity: row.get("quantity")?,
            interval_secs: row.get("interval_secs")?,
            rounds: row.get("rounds")?,
            leverage: row.get("leverage")?,
            side: row.get("side")?,
            order_type: row.get("order_type")?,
            strategy_parameters: row.get("strategy_parameters")?,
            status: row.get("status")?,
            process_id: row.get("process_id")?,
            process_started_at: row.get("process_started_at")?,
            proxy_session: row.get("proxy_session")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            last_error: row.get("last_error")?,
            total_rounds: row.get("total_rounds")?,
            successful_rounds: row.get("successful_rounds")?,
            failed_rounds: row.get("failed_rounds")?,
            supplement_orders: row.get("supplement_orders")?,
            total_cost_diff: row.get("total_cost_diff")?,
            buy_volume_usdt: row.get("buy_volume_usdt")?,
            sell_volume_usdt: row.get("sell_volume_usdt")?,
            total_fees_usdt: row.get("total_fees_usdt")?,
            initial_usdt_balance: row.get("initial_usdt_balance")?,
            final_usdt_balance: row.get("final_usdt_balance")?,
            usdt_balance_diff: row.get("usdt_balance_diff")?,
            net_loss_usdt: row.get("net_loss_usdt")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

fn decimal(value: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("invalid decimal in {field}: {value}"))
}

fn optional_decimal(value: Option<String>, field: &str) -> Result<Option<Decimal>> {
    value.map(|value| decimal(&value, field)).transpose()
}

impl TryFrom<TaskRow> for Task {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let status = TaskStatus::from_str(&row.status)?;
        let strategy_parameters = serde_json::from_str(&row.strategy_parameters)
            .with_context(|| format!("task {} has invalid strategy parameters", row.id))?;
        let process_started_at = row
            .process_started_at
            .map(u64::try_from)
            .transpose()
            .context("negative process start time")?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            wallet_id: row.wallet_id,
            strategy_id: row.strategy_id,
            name: row.name,
            description: row.description,
            params: TaskParams {
                symbol: row.symbol,
                quantity: decimal(&row.quantity, "quantity")?,
                interval_secs: row.interval_secs,
                rounds: row.rounds,
                leverage: row.leverage,
                side: Side::from_str(&row.side)?,
                order_type: OrderType::from_str(&row.order_type)?,
            },
            strategy_parameters,
            status,
            process_id: row.process_id,
            process_started_at,
            proxy_session: row.proxy_session,
            start_time: row.start_time,
            end_time: row.end_time,
            last_error: row.last_error,
            stats: TaskStats {
                total_rounds: row.total_rounds,
                successful_rounds: row.successful_rounds,
                failed_rounds: row.failed_rounds,
                supplement_orders: row.supplement_orders,
                total_cost_diff: decimal(&row.total_cost_diff, "total_cost_diff")?,
                buy_volume_usdt: decimal(&row.buy_volume_usdt, "buy_volume_usdt")?,
                sell_volume_usdt: decimal(&row.sell_volume_usdt, "sell_volume_usdt")?,
                total_fees_usdt: decimal(&row.total_fees_usdt, "total_fees_usdt")?,
                initial_usdt_balance: optional_decimal(
                    row.initial_usdt_balance,
                    "initial_usdt_balance",
                )?,
                final_usdt_balance: optional_decimal(row.final_usdt_balance, "final_usdt_balance")?,
                usdt_balance_diff: decimal(&row.usdt_balance_diff, "usdt_balance_diff")?,
                net_loss_usdt: decimal(&row.net_loss_usdt, "net_loss_usdt")?,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
