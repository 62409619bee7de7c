/*
[INPUT]:  Rows of the users/wallets/strategies/tasks tables, plaintext credentials from operators
[OUTPUT]: Typed domain records, run statistics and per-round deltas
[POS]:    Data layer - entities shared by store, orchestrator and execution unit
[UPDATE]: When the tasks schema gains statistics columns or wallet payload shapes change
*/

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::enums::{OrderType, Side, TaskStatus, WalletType};

pub type UserId = i64;
pub type WalletId = i64;
pub type StrategyId = i64;
pub type TaskId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub is_admin: bool,
    pub max_tasks: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub is_admin: bool,
    pub max_tasks: u32,
}

/// Wallet row. Secret fields only ever hold vault ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub wallet_type: WalletType,
    pub encrypted_api_key: Option<String>,
    pub encrypted_secret_key: Option<String>,
    pub user_address: Option<String>,
    pub signer_address: Option<String>,
    pub encrypted_private_key: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Decrypted wallet payload; lives only in process memory for the duration of a run.
pub enum WalletCredentials {
    Spot {
        api_key: SecretString,
        secret_key: SecretString,
    },
    Futures {
        user_address: String,
        signer_address: String,
        private_key: SecretString,
    },
}

impl WalletCredentials {
    pub fn wallet_type(&self) -> WalletType {
        match self {
            WalletCredentials::Spot { .. } => WalletType::Spot,
            WalletCredentials::Futures { .. } => WalletType::Futures,
        }
    }
}

impl fmt::Debug for WalletCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletCredentials::Spot { .. } => f
                .debug_struct("Spot")
                .field("api_key", &"***")
                .field("secret_key", &"***")
                .finish(),
            WalletCredentials::Futures {
                user_address,
                signer_address,
                ..
            } => f
                .debug_struct("Futures")
                .field("user_address", user_address)
                .field("signer_address", signer_address)
                .field("private_key", &"***")
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct NewWallet {
    pub user_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub credentials: WalletCredentials,
}

/// Display-safe view of a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaskedWallet {
    pub id: WalletId,
    pub name: String,
    pub wallet_type: WalletType,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub private_key: Option<String>,
    pub user_address: Option<String>,
    pub signer_address: Option<String>,
}

/// Catalog entry. `strategy_type` is the registry tag resolved at spawn time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: StrategyId,
    pub name: String,
    pub description: Option<String>,
    pub strategy_type: String,
    pub supported_wallet_types: Vec<WalletType>,
    pub default_parameters: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    pub fn supports(&self, wallet_type: WalletType) -> bool {
        self.supported_wallet_types.contains(&wallet_type)
    }
}

#[derive(Debug, Clone)]
pub struct NewStrategy {
    pub name: String,
    pub description: Option<String>,
    pub strategy_type: String,
    pub supported_wallet_types: Vec<WalletType>,
    pub default_parameters: serde_json::Value,
}

/// Trading parameters of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub symbol: String,
    pub quantity: Decimal,
    pub interval_secs: u32,
    pub rounds: u32,
    pub leverage: u32,
    pub side: Side,
    pub order_type: OrderType,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub strategy_id: StrategyId,
    pub name: String,
    pub description: Option<String>,
    pub params: TaskParams,
    pub strategy_parameters: serde_json::Value,
}

/// Cumulative statistics of the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_rounds: u32,
    pub successful_rounds: u32,
    pub failed_rounds: u32,
    pub supplement_orders: u32,
    pub total_cost_diff: Decimal,
    pub buy_volume_usdt: Decimal,
    pub sell_volume_usdt: Decimal,
    pub total_fees_usdt: Decimal,
    pub initial_usdt_balance: Option<Decimal>,
    pub final_usdt_balance: Option<Decimal>,
    pub usdt_balance_diff: Decimal,
    pub net_loss_usdt: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatError {
    #[error("round counters would reach {recorded} of {rounds} rounds")]
    RoundsExceeded { recorded: u32, rounds: u32 },
    #[error("{field} delta must not be negative")]
    NegativeDelta { field: &'static str },
}

impl TaskStats {
    pub fn recorded_rounds(&self) -> u32 {
        self.successful_rounds + self.failed_rounds
    }

    /// Fold one round's delta into the totals. On error `self` is left untouched.
    pub fn apply(&mut self, delta: &StatDelta, rounds: u32) -> Result<(), StatError> {
        delta.validate()?;

        let recorded = self.recorded_rounds() + delta.successful_rounds + delta.failed_rounds;
        if recorded > rounds {
            return Err(StatError::RoundsExceeded { recorded, rounds });
        }

        self.successful_rounds += delta.successful_rounds;
        self.failed_rounds += delta.failed_rounds;
        self.total_rounds = self.recorded_rounds();
        self.supplement_orders += delta.supplement_orders;
        self.total_cost_diff += delta.total_cost_diff;
        self.buy_volume_usdt += delta.buy_volume_usdt;
        self.sell_volume_usdt += delta.sell_volume_usdt;
        self.total_fees_usdt += delta.total_fees_usdt;
        self.net_loss_usdt += delta.net_loss_usdt;

        if let Some(balance) = delta.usdt_balance {
            if self.initial_usdt_balance.is_none() {
                self.initial_usdt_balance = Some(balance);
            }
            self.final_usdt_balance = Some(balance);
        }
        if let (Some(initial), Some(last)) = (self.initial_usdt_balance, self.final_usdt_balance) {
            self.usdt_balance_diff = last - initial;
        }

        Ok(())
    }
}

/// Statistics produced by exactly one round, written as a single atomic update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatDelta {
    pub successful_rounds: u32,
    pub failed_rounds: u32,
    pub supplement_orders: u32,
    pub total_cost_diff: Decimal,
    pub buy_volume_usdt: Decimal,
    pub sell_volume_usdt: Decimal,
    pub total_fees_usdt: Decimal,
    pub usdt_balance: Option<Decimal>,
    pub net_loss_usdt: Decimal,
}

impl StatDelta {
    pub fn success() -> Self {
        Self {
            successful_rounds: 1,
            ..Self::default()
        }
    }

    pub fn failure() -> Self {
        Self {
            failed_rounds: 1,
            ..Self::default()
        }
    }

    pub fn with_volume(mut self, buy: Decimal, sell: Decimal) -> Self {
        self.buy_volume_usdt = buy;
        self.sell_volume_usdt = sell;
        self
    }

    pub fn with_fees(mut self, fees: Decimal) -> Self {
        self.total_fees_usdt = fees;
        self
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.usdt_balance = Some(balance);
        self
    }

    pub fn validate(&self) -> Result<(), StatError> {
        let non_negative = [
            ("buy_volume_usdt", self.buy_volume_usdt),
            ("sell_volume_usdt", self.sell_volume_usdt),
            ("total_fees_usdt", self.total_fees_usdt),
        ];
        for (field, value) in non_negative {
            if value.is_sign_negative() && !value.is_zero() {
                return Err(StatError::NegativeDelta { field });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub strategy_id: StrategyId,
    pub name: String,
    pub description: Option<String>,
    pub params: TaskParams,
    pub strategy_parameters: serde_json::Value,
    pub status: TaskStatus,
    pub process_id: Option<u32>,
    /// Process start time (seconds since epoch) used to detect PID reuse.
    pub process_started_at: Option<u64>,
    pub proxy_session: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stats: TaskStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// True once every configured round has a recorded outcome.
    pub fn rounds_exhausted(&self) -> bool {
        self.stats.recorded_rounds() >= self.params.rounds
    }

    /// Percentage of recorded rounds that succeeded.
    pub fn success_rate(&self) -> f64 {
        let recorded = self.stats.recorded_rounds();
        if recorded == 0 {
            return 0.0;
        }
        f64::from(self.stats.successful_rounds) / f64::from(recorded) * 100.0
    }

    /// Recorded process identity; `None` unless both pid and start time are present.
    pub fn process_identity(&self) -> Option<ProcessIdentity> {
        Some(ProcessIdentity {
            pid: self.process_id?,
            started_at: self.process_started_at?,
        })
    }

    pub fn duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let start = self.start_time?;
        Some(self.end_time.unwrap_or(now) - start)
    }
}

/// OS-level identity of a supervised process. The start time guards against PID reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub started_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ErrorUpdate {
    #[default]
    Keep,
    Clear,
    Set(String),
    Append(String),
}

/// Field updates applied in the same row transaction as a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub process: Option<ProcessIdentity>,
    pub proxy_session: Option<String>,
    /// Clears process id, identity marker and proxy session together.
    pub clear_process: bool,
    pub stamp_start: bool,
    pub stamp_end: bool,
    pub error: ErrorUpdate,
}

impl StatusUpdate {
    pub fn started(process: ProcessIdentity, proxy_session: Option<String>) -> Self {
        Self {
            process: Some(process),
            proxy_session,
            stamp_start: true,
            error: ErrorUpdate::Clear,
            ..Self::default()
        }
    }

    pub fn finished(error: ErrorUpdate) -> Self {
        Self {
            clear_process: true,
            stamp_end: true,
            error,
            ..Self::default()
        }
    }
}
