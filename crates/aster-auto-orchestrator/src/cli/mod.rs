/*
[INPUT]:  Parsed command line, loaded AppConfig, shutdown token
[OUTPUT]: Subcommand definitions and dispatch to admin/supervise flows
[POS]:    CLI layer - binary only
[UPDATE]: When adding or renaming subcommands
*/

pub mod admin;
pub mod init;
pub mod supervise;

use anyhow::{Result, anyhow};
use aster_auto_core::types::{
    ConfigValueType, OrderType, Side, StrategyId, TaskId, UserId, WalletId, WalletType,
};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use aster_auto_orchestrator::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "aster-auto", version, about = "Trading task orchestrator")]
pub struct Cli {
    #[arg(long = "config", value_name = "PATH", global = true)]
    pub config_path: Option<PathBuf>,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info", global = true)]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile, start the given tasks and supervise them until they finish or a signal arrives
    Serve {
        #[arg(long = "task", value_name = "ID")]
        tasks: Vec<TaskId>,
    },
    /// Repair tasks left `running` by a previous orchestrator
    Reconcile,
    Status {
        task_id: TaskId,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long = "user", value_name = "ID")]
        user_id: Option<UserId>,
    },
    Stop {
        task_id: TaskId,
    },
    #[command(subcommand)]
    User(UserCommand),
    #[command(subcommand)]
    Wallet(WalletCommand),
    #[command(subcommand)]
    Strategy(StrategyCommand),
    #[command(subcommand)]
    Task(TaskCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Write a starter configuration file with a new vault master key
    Init {
        #[arg(long, short, default_value = "aster-auto.yaml")]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Print a freshly generated vault master key
    Keygen,
    /// Execution unit entry point, spawned by the supervisor
    #[command(hide = true)]
    RunTask { task_id: TaskId },
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    Add {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        admin: bool,
        #[arg(long = "max-tasks", default_value_t = 5)]
        max_tasks: u32,
        /// Prompt for a login password
        #[arg(long = "with-password")]
        with_password: bool,
    },
    List,
}

#[derive(Subcommand, Debug)]
pub enum WalletCommand {
    /// Add a wallet; secrets are prompted for, never read from arguments
    Add {
        #[arg(long = "user", value_name = "ID")]
        user_id: UserId,
        #[arg(long)]
        name: String,
        #[arg(long = "type", value_name = "TYPE")]
        wallet_type: WalletType,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "user-address")]
        user_address: Option<String>,
        #[arg(long = "signer-address")]
        signer_address: Option<String>,
    },
    List {
        #[arg(long = "user", value_name = "ID")]
        user_id: UserId,
    },
}

#[derive(Subcommand, Debug)]
pub enum StrategyCommand {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long = "type", value_name = "TAG")]
        strategy_type: String,
        #[arg(long = "wallet-types", value_delimiter = ',', required = true)]
        wallet_types: Vec<WalletType>,
        #[arg(long)]
        description: Option<String>,
        /// Default parameters as a JSON object
        #[arg(long)]
        defaults: Option<serde_json::Value>,
    },
    List,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    Create(TaskCreateArgs),
    Delete { task_id: TaskId },
}

#[derive(Args, Debug)]
pub struct TaskCreateArgs {
    #[arg(long = "user", value_name = "ID")]
    pub user_id: UserId,
    #[arg(long = "wallet", value_name = "ID")]
    pub wallet_id: WalletId,
    #[arg(long = "strategy", value_name = "ID")]
    pub strategy_id: StrategyId,
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub symbol: String,
    #[arg(long)]
    pub quantity: Decimal,
    /// Seconds between rounds
    #[arg(long)]
    pub interval: u32,
    #[arg(long)]
    pub rounds: u32,
    #[arg(long, default_value_t = 1)]
    pub leverage: u32,
    #[arg(long, default_value = "buy")]
    pub side: Side,
    #[arg(long = "order-type", default_value = "market")]
    pub order_type: OrderType,
    /// Strategy parameter overrides as a JSON object
    #[arg(long)]
    pub params: Option<serde_json::Value>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Set {
        key: String,
        value: String,
        #[arg(long = "type", default_value = "string")]
        value_type: ConfigValueType,
        #[arg(long)]
        description: Option<String>,
    },
    Get {
        key: String,
    },
}

pub async fn dispatch(
    command: Command,
    config: AppConfig,
    config_path: &Path,
    shutdown: CancellationToken,
) -> Result<()> {
    match command {
        Command::Serve { tasks } => supervise::serve(config, config_path, tasks, shutdown).await,
        Command::Reconcile => supervise::reconcile(config, config_path).await,
        Command::Status { task_id, json } => supervise::status(config, task_id, json),
        Command::List { user_id } => supervise::list(config, user_id),
        Command::Stop { task_id } => supervise::stop(config, config_path, task_id).await,
        Command::User(command) => admin::user(config, command),
        Command::Wallet(command) => admin::wallet(config, command),
        Command::Strategy(command) => admin::strategy(config, command),
        Command::Task(command) => admin::task(config, command),
        Command::Config(command) => admin::system_config(config, command),
        other @ (Command::Init { .. } | Command::Keygen | Command::RunTask { .. }) => {
            Err(anyhow!("{other:?} runs before configuration is loaded"))
        }
    }
}
