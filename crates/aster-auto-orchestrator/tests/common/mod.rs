/*
[INPUT]:  Temporary directories, generated master key, runner commands
[OUTPUT]: Seeded store, config file for real execution units, orchestrator parts
[POS]:    Test infrastructure - shared across orchestrator integration tests
[UPDATE]: When OrchestratorParts or the seeded entities change
*/

#![allow(dead_code)]

use aster_auto_core::types::{
    ConfigValueType, NewStrategy, NewTask, NewUser, NewWallet, OrderType, Side, Task, TaskId,
    TaskParams, TaskStatus, UserId, WalletCredentials, WalletType,
};
use aster_auto_core::{CredentialVault, Database, SMARTPROXY_ENABLED_KEY};
use aster_auto_orchestrator::config::{CONFIG_ENV, PremiumKind, PremiumProxyConfig, ProxyConfig};
use aster_auto_orchestrator::{
    OrchestratorParts, ProcessSupervisor, ProxySessionAllocator, RunnerCommand, StrategyRegistry,
    TaskOrchestrator,
};
use rust_decimal::Decimal;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{Instant, sleep};

pub const GRACE: Duration = Duration::from_secs(3);

pub struct Fixture {
    // Keeps the database, config and logs alive for the test's lifetime.
    pub dir: TempDir,
    pub db: Database,
    pub master_key: String,
    pub config_path: PathBuf,
    pub user_id: UserId,
    pub wallet_id: i64,
    pub strategy_id: i64,
}

pub fn fixture(max_tasks: u32) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("store.db");
    let db = Database::new(&db_path).unwrap();
    let master_key = CredentialVault::generate_master_key();
    let vault = CredentialVault::from_config_value(&master_key).unwrap();

    let config_path = dir.path().join("aster-auto.yaml");
    std::fs::write(
        &config_path,
        format!(
            "database:\n  path: \"{}\"\nvault:\n  master_key: \"{}\"\nrunner:\n  log_dir: \"{}\"\n  round_grace_ms: 2000\n",
            db_path.display(),
            master_key,
            dir.path().join("logs").display()
        ),
    )
    .unwrap();

    let user_id = db
        .create_user(&NewUser {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: None,
            is_admin: false,
            max_tasks,
        })
        .unwrap();
    let wallet_id = db
        .create_wallet(
            &vault,
            &NewWallet {
                user_id,
                name: "main".to_string(),
                description: None,
                credentials: WalletCredentials::Spot {
                    api_key: SecretString::from("ak-live-91827364".to_string()),
                    secret_key: SecretString::from("sk-live-55443322".to_string()),
                },
            },
        )
        .unwrap();
    let strategy_id = db
        .create_strategy(&NewStrategy {
            name: "Paper".to_string(),
            description: None,
            strategy_type: "paper".to_string(),
            supported_wallet_types: vec![WalletType::Spot, WalletType::Futures],
            default_parameters: serde_json::json!({ "fill_price": 250 }),
        })
        .unwrap();

    Fixture {
        dir,
        db,
        master_key,
        config_path,
        user_id,
        wallet_id,
        strategy_id,
    }
}

impl Fixture {
    pub fn vault(&self) -> CredentialVault {
        CredentialVault::from_config_value(&self.master_key).unwrap()
    }

    pub fn create_task(
        &self,
        name: &str,
        rounds: u32,
        strategy_parameters: serde_json::Value,
    ) -> TaskId {
        self.db
            .create_task(&NewTask {
                user_id: self.user_id,
                wallet_id: self.wallet_id,
                strategy_id: self.strategy_id,
                name: name.to_string(),
                description: None,
                params: TaskParams {
                    symbol: "BTC-USD".to_string(),
                    quantity: Decimal::new(2, 1),
                    interval_secs: 1,
                    rounds,
                    leverage: 1,
                    side: Side::Both,
                    order_type: OrderType::Market,
                },
                strategy_parameters,
            })
            .unwrap()
    }

    /// The real execution unit binary, pointed at this fixture's config file.
    pub fn unit_command(&self) -> RunnerCommand {
        let mut command =
            RunnerCommand::new(env!("CARGO_BIN_EXE_aster-auto"), vec!["run-task".to_string()]);
        command.envs.push((
            CONFIG_ENV.to_string(),
            self.config_path.to_string_lossy().into_owned(),
        ));
        command
    }

    pub fn parts(&self, command: RunnerCommand) -> OrchestratorParts {
        self.parts_with_vault(command, self.vault())
    }

    pub fn parts_with_vault(
        &self,
        command: RunnerCommand,
        vault: CredentialVault,
    ) -> OrchestratorParts {
        OrchestratorParts {
            db: self.db.clone(),
            vault,
            registry: Arc::new(StrategyRegistry::builtin()),
            proxies: ProxySessionAllocator::new(ProxyConfig::default(), Arc::new(self.db.clone())),
            supervisor: ProcessSupervisor::new(command, GRACE, Duration::from_secs(2))
                .with_poll_interval(Duration::from_millis(50)),
        }
    }

    /// Parts whose allocator leases premium sessions. No probe url, so nothing is dialed.
    pub fn premium_parts(&self, command: RunnerCommand) -> OrchestratorParts {
        self.db
            .set_config_value(SMARTPROXY_ENABLED_KEY, "true", ConfigValueType::Boolean, None)
            .unwrap();
        let premium = PremiumProxyConfig {
            enabled: true,
            base_username: "sp9y3nhxbw".to_string(),
            password: Some(SecretString::from("gatepass".to_string())),
            host: "127.0.0.1".to_string(),
            port: 10000,
            kind: PremiumKind::Residential,
            probe_url: None,
            ..PremiumProxyConfig::default()
        };

        let mut parts = self.parts(command);
        parts.proxies = ProxySessionAllocator::new(
            ProxyConfig {
                premium,
                dev_url: None,
            },
            Arc::new(self.db.clone()),
        );
        parts
    }

    pub async fn orchestrator(&self, command: RunnerCommand) -> TaskOrchestrator {
        let (orchestrator, _) = TaskOrchestrator::bootstrap(self.parts(command))
            .await
            .unwrap();
        orchestrator
    }

    pub fn task(&self, task_id: TaskId) -> Task {
        self.db.get_task(task_id).unwrap().unwrap()
    }
}

/// `/bin/sh -c <script>`; the task id arrives as `$1`.
pub fn sh(script: &str) -> RunnerCommand {
    RunnerCommand::new(
        "/bin/sh",
        vec!["-c".to_string(), script.to_string(), "unit".to_string()],
    )
}

pub async fn wait_for_status(
    db: &Database,
    task_id: TaskId,
    status: TaskStatus,
    within: Duration,
) -> Task {
    let deadline = Instant::now() + within;
    loop {
        let task = db.get_task(task_id).unwrap().unwrap();
        if task.status == status {
            return task;
        }
        if Instant::now() >= deadline {
            panic!(
                "task {task_id} stayed {} (wanted {status}), last_error={:?}",
                task.status, task.last_error
            );
        }
        sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_for_rounds(db: &Database, task_id: TaskId, rounds: u32, within: Duration) -> Task {
    let deadline = Instant::now() + within;
    loop {
        let task = db.get_task(task_id).unwrap().unwrap();
        if task.stats.recorded_rounds() >= rounds {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task {task_id} recorded only {} rounds",
            task.stats.recorded_rounds()
        );
        sleep(Duration::from_millis(50)).await;
    }
}
