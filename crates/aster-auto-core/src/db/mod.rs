/*
[INPUT]:  schema.sql, domain types, CredentialVault for wallet secrets at rest.
[OUTPUT]: SQLite-backed Database pool shared by the orchestrator and every execution unit.
[POS]:    Persistence layer - users, wallets, strategies, tasks and system_config.
[UPDATE]: When schema.sql or the domain model shapes change.
*/

mod tasks;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};
use secrecy::ExposeSecret;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::types::{
    ConfigValueType, NewStrategy, NewUser, NewWallet, Strategy, StrategyId, User, UserId, Wallet,
    WalletCredentials, WalletId, WalletType,
};
use crate::vault::CredentialVault;

/// Config key holding the operator toggle for the premium proxy provider.
pub const SMARTPROXY_ENABLED_KEY: &str = "smartproxy_enabled";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the store. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct Database {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemConfigEntry {
    pub key: String,
    pub value: Option<String>,
    pub value_type: ConfigValueType,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Execution units open the same file from other processes.
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });

        let pool = r2d2::Pool::new(manager).context("create sqlite pool")?;
        let db = Self { pool };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("get sqlite connection")
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("schema.sql"))
            .context("apply schema.sql")?;
        Ok(())
    }

    // ---- users ----

    pub fn create_user(&self, user: &NewUser) -> Result<UserId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username, email, password_hash, is_admin, max_tasks, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                user.username,
                user.email,
                user.password_hash,
                user.is_admin,
                user.max_tasks,
                Utc::now()
            ],
        )
        .with_context(|| format!("insert user {}", user.username))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![user_id],
            user_from_row,
        )
        .optional()
        .context("fetch user")
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
            params![username],
            user_from_row,
        )
        .optional()
        .context("fetch user by username")
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
            .context("prepare user list")?;
        let rows = stmt
            .query_map([], user_from_row)
            .context("query user list")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read user list")
    }

    pub fn set_user_active(&self, user_id: UserId, active: bool) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE users SET is_active = ?1 WHERE id = ?2",
                params![active, user_id],
            )
            .context("update user active flag")?;
        Ok(changed == 1)
    }

    pub fn set_user_max_tasks(&self, user_id: UserId, max_tasks: u32) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE users SET max_tasks = ?1 WHERE id = ?2",
                params![max_tasks, user_id],
            )
            .context("update user quota")?;
        Ok(changed == 1)
    }

    // ---- wallets ----

    /// Insert a wallet; secret fields are encrypted before they reach the row.
    pub fn create_wallet(&self, vault: &CredentialVault, wallet: &NewWallet) -> Result<WalletId> {
        let (api_key, secret_key, user_address, signer_address, private_key) =
            match &wallet.credentials {
                WalletCredentials::Spot {
                    api_key,
                    secret_key,
                } => (
                    Some(vault.encrypt(api_key.expose_secret())?),
                    Some(vault.encrypt(secret_key.expose_secret())?),
                    None,
                    None,
                    None,
                ),
                WalletCredentials::Futures {
                    user_address,
                    signer_address,
                    private_key,
                } => (
                    None,
                    None,
                    Some(user_address.clone()),
                    Some(signer_address.clone()),
                    Some(vault.encrypt(private_key.expose_secret())?),
                ),
            };

        let conn = self.conn()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO wallets (user_id, name, description, wallet_type, encrypted_api_key,
                encrypted_secret_key, user_address, signer_address, encrypted_private_key,
                is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
            params![
                wallet.user_id,
                wallet.name,
                wallet.description,
                wallet.credentials.wallet_type().as_str(),
                api_key,
                secret_key,
                user_address,
                signer_address,
                private_key,
                now
            ],
        )
        .with_context(|| format!("insert wallet {}", wallet.name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE id = ?1"),
                params![wallet_id],
                WalletRow::from_row,
            )
            .optional()
            .context("fetch wallet")?;
        row.map(Wallet::try_from).transpose()
    }

    pub fn list_wallets_for_user(&self, user_id: UserId) -> Result<Vec<Wallet>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = ?1 ORDER BY id"
            ))
            .context("prepare wallet list")?;
        let rows = stmt
            .query_map(params![user_id], WalletRow::from_row)
            .context("query wallet list")?;

        let mut wallets = Vec::new();
        for row in rows {
            wallets.push(Wallet::try_from(row?)?);
        }
        Ok(wallets)
    }

    pub fn set_wallet_active(&self, wallet_id: WalletId, active: bool) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE wallets SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active, Utc::now(), wallet_id],
            )
            .context("update wallet active flag")?;
        Ok(changed == 1)
    }

    pub fn touch_wallet_last_used(&self, wallet_id: WalletId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE wallets SET last_used = ?1 WHERE id = ?2",
            params![Utc::now(), wallet_id],
        )
        .context("update wallet last_used")?;
        Ok(())
    }

    // ---- strategies ----

    pub fn create_strategy(&self, strategy: &NewStrategy) -> Result<StrategyId> {
        if strategy.supported_wallet_types.is_empty() {
            return Err(anyhow!(
                "strategy {} must support at least one wallet type",
                strategy.name
            ));
        }
        let conn = self.conn()?;
        let default_parameters = serde_json::to_string(&strategy.default_parameters)
            .context("serialize default parameters")?;
        conn.execute(
            "INSERT INTO strategies (name, description, strategy_type, supported_wallet_types,
                default_parameters, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                strategy.name,
                strategy.description,
                strategy.strategy_type,
                encode_wallet_types(&strategy.supported_wallet_types),
                default_parameters,
                Utc::now()
            ],
        )
        .with_context(|| format!("insert strategy {}", strategy.name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_strategy(&self, strategy_id: StrategyId) -> Result<Option<Strategy>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {STRATEGY_COLUMNS} FROM strategies WHERE id = ?1"),
                params![strategy_id],
                StrategyRow::from_row,
            )
            .optional()
            .context("fetch strategy")?;
        row.map(Strategy::try_from).transpose()
    }

    pub fn list_strategies(&self) -> Result<Vec<Strategy>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STRATEGY_COLUMNS} FROM strategies ORDER BY id"
            ))
            .context("prepare strategy list")?;
        let rows = stmt
            .query_map([], StrategyRow::from_row)
            .context("query strategy list")?;

        let mut strategies = Vec::new();
        for row in rows {
            strategies.push(Strategy::try_from(row?)?);
        }
        Ok(strategies)
    }

    pub fn set_strategy_active(&self, strategy_id: StrategyId, active: bool) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE strategies SET is_active = ?1 WHERE id = ?2",
                params![active, strategy_id],
            )
            .context("update strategy active flag")?;
        Ok(changed == 1)
    }

    // ---- system_config ----

    pub fn get_config_value(&self, key: &str) -> Result<Option<SystemConfigEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT config_key, config_value, config_type, description, updated_at
                 FROM system_config WHERE config_key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, DateTime<Utc>>(4)?,
                    ))
                },
            )
            .optional()
            .context("fetch system config")?;

        row.map(
            |(key, value, value_type, description, updated_at)| -> Result<SystemConfigEntry> {
                Ok(SystemConfigEntry {
                key,
                value,
                    value_type: ConfigValueType::from_str(&value_type)?,
                    description,
                    updated_at,
                })
            },
        )
        .transpose()
    }

    /// Upsert a config value. An existing description is kept when none is given.
    pub fn set_config_value(
        &self,
        key: &str,
        value: &str,
        value_type: ConfigValueType,
        description: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO system_config (config_key, config_value, config_type, description, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(config_key) DO UPDATE SET
                config_value = excluded.config_value,
                config_type = excluded.config_type,
                description = COALESCE(excluded.description, system_config.description),
                updated_at = excluded.updated_at",
            params![key, value, value_type.as_str(), description, Utc::now()],
        )
        .with_context(|| format!("upsert system config {key}"))?;
        Ok(())
    }

    /// `None` when the key is absent or its value is not a recognisable boolean.
    pub fn get_config_bool(&self, key: &str) -> Result<Option<bool>> {
        let entry = self.get_config_value(key)?;
        Ok(entry.and_then(|entry| entry.value.as_deref().and_then(parse_bool)))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        other => {
            tracing::warn!(value = other, "ignoring non-boolean config value");
            None
        }
    }
}

fn encode_wallet_types(types: &[WalletType]) -> String {
    types
        .iter()
        .map(WalletType::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_wallet_types(value: &str) -> Result<Vec<WalletType>> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| WalletType::from_str(part).map_err(anyhow::Error::from))
        .collect()
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, is_admin, max_tasks, is_active, created_at, last_login";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_admin: row.get(4)?,
        max_tasks: row.get(5)?,
        is_active: row.get(6)?,
        created_at: row.get(7)?,
        last_login: row.get(8)?,
    })
}

const WALLET_COLUMNS: &str = "id, user_id, name, description, wallet_type, encrypted_api_key, \
     encrypted_secret_key, user_address, signer_address, encrypted_private_key, is_active, \
     created_at, updated_at, last_used";

struct WalletRow {
    id: i64,
    user_id: i64,
    name: String,
    description: Option<String>,
    wallet_type: String,
    encrypted_api_key: Option<String>,
    encrypted_secret_key: Option<String>,
    user_address: Option<String>,
    signer_address: Option<String>,
    encrypted_private_key: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_used: Option<DateTime<Utc>>,
}

impl WalletRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            wallet_type: row.get(4)?,
            encrypted_api_key: row.get(5)?,
            encrypted_secret_key: row.get(6)?,
            user_address: row.get(7)?,
            signer_address: row.get(8)?,
            encrypted_private_key: row.get(9)?,
            is_active: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            last_used: row.get(13)?,
        })
    }
}

impl TryFrom<WalletRow> for Wallet {
    type Error = anyhow::Error;

    fn try_from(row: WalletRow) -> Result<Self> {
        let wallet_type = WalletType::from_str(&row.wallet_type)
            .with_context(|| format!("wallet {} has an invalid type", row.id))?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            description: row.description,
            wallet_type,
            encrypted_api_key: row.encrypted_api_key,
            encrypted_secret_key: row.encrypted_secret_key,
            user_address: row.user_address,
            signer_address: row.signer_address,
            encrypted_private_key: row.encrypted_private_key,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_used: row.last_used,
        })
    }
}

const STRATEGY_COLUMNS: &str = "id, name, description, strategy_type, supported_wallet_types, \
     default_parameters, is_active, created_at";

struct StrategyRow {
    id: i64,
    name: String,
    description: Option<String>,
    strategy_type: String,
    supported_wallet_types: String,
    default_parameters: String,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl StrategyRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            strategy_type: row.get(3)?,
            supported_wallet_types: row.get(4)?,
            default_parameters: row.get(5)?,
            is_active: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl TryFrom<StrategyRow> for Strategy {
    type Error = anyhow::Error;

    fn try_from(row: StrategyRow) -> Result<Self> {
        let supported_wallet_types = decode_wallet_types(&row.supported_wallet_types)
            .with_context(|| format!("strategy {} has invalid wallet types", row.id))?;
        let default_parameters = serde_json::from_str(&row.default_parameters)
            .with_context(|| format!("strategy {} has invalid default parameters", row.id))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            strategy_type: row.strategy_type,
            supported_wallet_types,
            default_parameters,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}
