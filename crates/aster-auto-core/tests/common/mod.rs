/*
[INPUT]:  Temporary directories and a freshly generated master key
[OUTPUT]: Seeded Database fixtures (user, wallet, strategy, task)
[POS]:    Test infrastructure - shared across core integration tests
[UPDATE]: When the seeded entities or NewTask shape change
*/

#![allow(dead_code)]

use aster_auto_core::types::{
    NewStrategy, NewTask, NewUser, NewWallet, OrderType, Side, TaskId, TaskParams, UserId,
    WalletCredentials, WalletType,
};
use aster_auto_core::{CredentialVault, Database};
use rust_decimal::Decimal;
use secrecy::SecretString;
use tempfile::TempDir;

pub struct Fixture {
    // Keeps the database file alive for the test's lifetime.
    pub dir: TempDir,
    pub db: Database,
    pub vault: CredentialVault,
    pub user_id: UserId,
    pub wallet_id: i64,
    pub strategy_id: i64,
}

pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(dir.path().join("store.db")).unwrap();
    let vault = CredentialVault::from_config_value(&CredentialVault::generate_master_key()).unwrap();

    let user_id = db
        .create_user(&NewUser {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: None,
            is_admin: false,
            max_tasks: 2,
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
                    api_key: SecretString::from("ak-test-000111".to_string()),
                    secret_key: SecretString::from("sk-test-222333".to_string()),
                },
            },
        )
        .unwrap();
    let strategy_id = db
        .create_strategy(&NewStrategy {
            name: "Paper".to_string(),
            description: None,
            strategy_type: "paper".to_string(),
            supported_wallet_types: vec![WalletType::Spot],
            default_parameters: serde_json::json!({}),
        })
        .unwrap();

    Fixture {
        dir,
        db,
        vault,
        user_id,
        wallet_id,
        strategy_id,
    }
}

pub fn params(rounds: u32) -> TaskParams {
    TaskParams {
        symbol: "BTC-USD".to_string(),
        quantity: Decimal::new(1, 3),
        interval_secs: 1,
        rounds,
        leverage: 1,
        side: Side::Buy,
        order_type: OrderType::Market,
    }
}

pub fn create_task(fixture: &Fixture, name: &str, rounds: u32) -> TaskId {
    fixture
        .db
        .create_task(&NewTask {
            user_id: fixture.user_id,
            wallet_id: fixture.wallet_id,
            strategy_id: fixture.strategy_id,
            name: name.to_string(),
            description: None,
            params: params(rounds),
            strategy_parameters: serde_json::json!({}),
        })
        .unwrap()
}
