/*
[INPUT]:  strategy_type tags from the strategies table, merged JSON parameters
[OUTPUT]: StrategyRegistry of statically known factories and RoundStrategy instances
[POS]:    Strategy layer - per-round trading work executed inside the execution unit
[UPDATE]: When registering new strategy types or changing the round contract
*/

use async_trait::async_trait;
use aster_auto_core::types::{Side, StatDelta, Task, WalletCredentials, WalletType};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::proxy::EgressIdentity;

pub const PAPER_STRATEGY: &str = "paper";

/// Outcome of one failed round.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundError {
    /// Counted as a failed round; the task continues.
    #[error("round failed: {0}")]
    Recoverable(String),
    /// Counted as a failed round; the task aborts with `last_error` set.
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("strategy type {0} is already registered")]
    DuplicateTag(String),

    #[error("strategy type {0} must support at least one wallet type")]
    NoWalletTypes(String),

    #[error("strategy type {0} is not registered")]
    Unknown(String),

    #[error("invalid parameters for {tag}: {source}")]
    InvalidParameters {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything a round may read. Credentials stay in this process.
pub struct RoundContext<'a> {
    pub task: &'a Task,
    pub credentials: &'a WalletCredentials,
    pub egress: Option<&'a EgressIdentity>,
}

/// Fills and balances observed during one successful round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundReport {
    pub buy_volume_usdt: Decimal,
    pub sell_volume_usdt: Decimal,
    pub fees_usdt: Decimal,
    pub supplement_orders: u32,
    pub cost_diff: Decimal,
    pub net_loss_usdt: Decimal,
    pub usdt_balance: Option<Decimal>,
}

impl RoundReport {
    pub fn into_delta(self) -> StatDelta {
        StatDelta {
            supplement_orders: self.supplement_orders,
            total_cost_diff: self.cost_diff,
            net_loss_usdt: self.net_loss_usdt,
            usdt_balance: self.usdt_balance,
            ..StatDelta::success()
                .with_volume(self.buy_volume_usdt, self.sell_volume_usdt)
                .with_fees(self.fees_usdt)
        }
    }
}

#[async_trait]
pub trait RoundStrategy: Send {
    /// Execute round `round` (1-based).
    async fn execute_round(
        &mut self,
        round: u32,
        ctx: &RoundContext<'_>,
    ) -> Result<RoundReport, RoundError>;
}

pub type StrategyFactory = fn(&serde_json::Value) -> Result<Box<dyn RoundStrategy>, serde_json::Error>;

struct Registration {
    factory: StrategyFactory,
    wallet_types: Vec<WalletType>,
}

/// Maps `strategy_type` tags to constructors known at compile time.
#[derive(Default)]
pub struct StrategyRegistry {
    entries: HashMap<String, Registration>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every strategy shipped in this binary.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .entries
            .insert(PAPER_STRATEGY.to_string(), Registration {
                factory: PaperStrategy::build,
                wallet_types: vec![WalletType::Spot, WalletType::Futures],
            });
        registry
    }

    pub fn register(
        &mut self,
        tag: &str,
        wallet_types: Vec<WalletType>,
        factory: StrategyFactory,
    ) -> Result<(), RegistryError> {
        if wallet_types.is_empty() {
            return Err(RegistryError::NoWalletTypes(tag.to_string()));
        }
        if self.entries.contains_key(tag) {
            return Err(RegistryError::DuplicateTag(tag.to_string()));
        }
        self.entries.insert(tag.to_string(), Registration {
            factory,
            wallet_types,
        });
        Ok(())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// `None` when `tag` is unknown.
    pub fn supports(&self, tag: &str, wallet_type: WalletType) -> Option<bool> {
        self.entries
            .get(tag)
            .map(|entry| entry.wallet_types.contains(&wallet_type))
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub fn build(
        &self,
        tag: &str,
        parameters: &serde_json::Value,
    ) -> Result<Box<dyn RoundStrategy>, RegistryError> {
        let entry = self
            .entries
            .get(tag)
            .ok_or_else(|| RegistryError::Unknown(tag.to_string()))?;
        (entry.factory)(parameters).map_err(|source| RegistryError::InvalidParameters {
            tag: tag.to_string(),
            source,
        })
    }
}

/// Overlay task-level parameters on the strategy defaults (top-level keys only).
pub fn merge_parameters(
    defaults: &serde_json::Value,
    overrides: &serde_json::Value,
) -> serde_json::Value {
    match (defaults, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(extra)) => {
            let mut merged = base.clone();
            for (key, value) in extra {
                merged.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        (_, serde_json::Value::Null) => defaults.clone(),
        _ => overrides.clone(),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PaperParams {
    #[serde(default)]
    fail_rounds: Vec<u32>,
    #[serde(default)]
    fatal_round: Option<u32>,
    #[serde(default = "default_fill_price")]
    fill_price: Decimal,
    #[serde(default = "default_fee_rate")]
    fee_rate: Decimal,
    #[serde(default = "default_starting_balance")]
    starting_balance: Decimal,
    #[serde(default)]
    round_delay_ms: u64,
}

fn default_fill_price() -> Decimal {
    Decimal::new(100, 0)
}

fn default_fee_rate() -> Decimal {
    Decimal::new(5, 4)
}

fn default_starting_balance() -> Decimal {
    Decimal::new(1000, 0)
}

/// Simulated fills at a fixed price. Scripted failures make lifecycle paths reproducible.
#[derive(Debug)]
pub struct PaperStrategy {
    params: PaperParams,
    balance: Decimal,
}

impl PaperStrategy {
    pub fn build(parameters: &serde_json::Value) -> Result<Box<dyn RoundStrategy>, serde_json::Error> {
        let params: PaperParams = serde_json::from_value(parameters.clone())?;
        Ok(Box::new(PaperStrategy {
            balance: params.starting_balance,
            params,
        }))
    }
}

#[async_trait]
impl RoundStrategy for PaperStrategy {
    async fn execute_round(
        &mut self,
        round: u32,
        ctx: &RoundContext<'_>,
    ) -> Result<RoundReport, RoundError> {
        if self.params.round_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.params.round_delay_ms)).await;
        }
        if self.params.fatal_round == Some(round) {
            return Err(RoundError::Fatal(format!("scripted fatal error in round {round}")));
        }
        if self.params.fail_rounds.contains(&round) {
            return Err(RoundError::Recoverable(format!(
                "scripted rejection in round {round}"
            )));
        }

        let notional = ctx.task.params.quantity * self.params.fill_price;
        let (buy, sell) = match ctx.task.params.side {
            Side::Buy => (notional, Decimal::ZERO),
            Side::Sell => (Decimal::ZERO, notional),
            Side::Both => (notional, notional),
        };
        let fees = (buy + sell) * self.params.fee_rate;
        self.balance -= fees;

        Ok(RoundReport {
            buy_volume_usdt: buy,
            sell_volume_usdt: sell,
            fees_usdt: fees,
            net_loss_usdt: fees,
            usdt_balance: Some(self.balance),
            ..RoundReport::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aster_auto_core::types::{OrderType, TaskParams, TaskStats, TaskStatus};
    use chrono::Utc;
    use secrecy::SecretString;
    use serde_json::json;

    fn task(side: Side) -> Task {
        let now = Utc::now();
        Task {
            id: 1,
            user_id: 1,
            wallet_id: 1,
            strategy_id: 1,
            name: "paper".to_string(),
            description: None,
            params: TaskParams {
                symbol: "BTC-USD".to_string(),
                quantity: Decimal::new(2, 0),
                interval_secs: 0,
                rounds: 3,
                leverage: 1,
                side,
                order_type: OrderType::Market,
            },
            strategy_parameters: json!({}),
            status: TaskStatus::Running,
            process_id: None,
            process_started_at: None,
            proxy_session: None,
            start_time: None,
            end_time: None,
            last_error: None,
            stats: TaskStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn credentials() -> WalletCredentials {
        WalletCredentials::Spot {
            api_key: SecretString::from("k".to_string()),
            secret_key: SecretString::from("s".to_string()),
        }
    }

    #[test]
    fn test_registry_rejects_duplicates_and_empty_wallet_types() {
        let mut registry = StrategyRegistry::builtin();
        assert!(matches!(
            registry.register(PAPER_STRATEGY, vec![WalletType::Spot], PaperStrategy::build),
            Err(RegistryError::DuplicateTag(_))
        ));
        assert!(matches!(
            registry.register("grid", Vec::new(), PaperStrategy::build),
            Err(RegistryError::NoWalletTypes(_))
        ));
        registry
            .register("grid", vec![WalletType::Futures], PaperStrategy::build)
            .unwrap();
        assert_eq!(registry.tags(), vec!["grid", "paper"]);
        assert_eq!(registry.supports("grid", WalletType::Spot), Some(false));
        assert_eq!(registry.supports("unknown", WalletType::Spot), None);
    }

    #[test]
    fn test_unknown_tag_and_bad_parameters() {
        let registry = StrategyRegistry::builtin();
        assert!(matches!(
            registry.build("martingale", &json!({})),
            Err(RegistryError::Unknown(_))
        ));
        assert!(matches!(
            registry.build(PAPER_STRATEGY, &json!({"fail_rounds": "all"})),
            Err(RegistryError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_merge_parameters_overlays_task_values() {
        let merged = merge_parameters(
            &json!({"fee_rate": "0.001", "fill_price": 50}),
            &json!({"fill_price": 60}),
        );
        assert_eq!(merged, json!({"fee_rate": "0.001", "fill_price": 60}));
        assert_eq!(merge_parameters(&json!({"a": 1}), &serde_json::Value::Null), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_paper_rounds_report_volume_and_scripted_failures() {
        let registry = StrategyRegistry::builtin();
        let mut strategy = registry
            .build(PAPER_STRATEGY, &json!({"fail_rounds": [2], "fatal_round": 3}))
            .unwrap();
        let task = task(Side::Both);
        let credentials = credentials();
        let ctx = RoundContext {
            task: &task,
            credentials: &credentials,
            egress: None,
        };

        let report = strategy.execute_round(1, &ctx).await.unwrap();
        assert_eq!(report.buy_volume_usdt, Decimal::new(200, 0));
        assert_eq!(report.sell_volume_usdt, Decimal::new(200, 0));
        assert_eq!(report.fees_usdt, Decimal::new(2, 1));
        assert_eq!(report.usdt_balance, Some(Decimal::new(9998, 1)));

        assert!(matches!(
            strategy.execute_round(2, &ctx).await,
            Err(RoundError::Recoverable(_))
        ));
        assert!(matches!(
            strategy.execute_round(3, &ctx).await,
            Err(RoundError::Fatal(_))
        ));
    }

    #[test]
    fn test_report_becomes_success_delta() {
        let delta = RoundReport {
            buy_volume_usdt: Decimal::new(10, 0),
            fees_usdt: Decimal::new(1, 2),
            ..RoundReport::default()
        }
        .into_delta();
        assert_eq!(delta.successful_rounds, 1);
        assert_eq!(delta.failed_rounds, 0);
        assert_eq!(delta.buy_volume_usdt, Decimal::new(10, 0));
        assert_eq!(delta.total_fees_usdt, Decimal::new(1, 2));
    }
}
