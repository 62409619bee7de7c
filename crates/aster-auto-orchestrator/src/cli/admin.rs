/*
[INPUT]:  User/wallet/strategy/task/config subcommands, hidden secret prompts
[OUTPUT]: Rows written through the store and TaskService, masked console output
[POS]:    CLI admin flows
[UPDATE]: When entity fields or creation rules change
*/

use anyhow::{Context, Result, anyhow, bail};
use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;
use aster_auto_core::types::{
    ConfigValueType, NewStrategy, NewTask, NewUser, NewWallet, TaskParams, WalletCredentials,
    WalletType,
};
use aster_auto_core::Database;
use console::style;
use dialoguer::{Password, theme::ColorfulTheme};
use rand::RngCore;
use secrecy::SecretString;
use std::sync::Arc;

use aster_auto_orchestrator::{AppConfig, StrategyRegistry, TaskService};

use super::{ConfigCommand, StrategyCommand, TaskCommand, UserCommand, WalletCommand};

fn open_store(config: &AppConfig) -> Result<Database> {
    Database::new(&config.database.path).context("open task store")
}

fn task_service(config: &AppConfig) -> Result<TaskService> {
    Ok(TaskService::new(
        open_store(config)?,
        Arc::new(StrategyRegistry::builtin()),
    ))
}

pub fn user(config: AppConfig, command: UserCommand) -> Result<()> {
    let db = open_store(&config)?;
    match command {
        UserCommand::Add {
            username,
            email,
            admin,
            max_tasks,
            with_password,
        } => {
            if db.get_user_by_username(&username)?.is_some() {
                bail!("user {username} already exists");
            }
            let password_hash = if with_password {
                let password = Password::with_theme(&ColorfulTheme::default())
                    .with_prompt("Password")
                    .with_confirmation("Confirm password", "Passwords do not match")
                    .interact()?;
                Some(hash_password(&password)?)
            } else {
                None
            };
            let user_id = db.create_user(&NewUser {
                username: username.clone(),
                email,
                password_hash,
                is_admin: admin,
                max_tasks,
            })?;
            println!(
                "{} user {} ({})",
                style("Created").bold().green(),
                style(&username).cyan(),
                user_id
            );
        }
        UserCommand::List => {
            for user in db.list_users()? {
                println!(
                    "{:>4}  {:<16} {:<28} max_tasks={} {}{}",
                    user.id,
                    user.username,
                    user.email,
                    user.max_tasks,
                    if user.is_admin { "admin " } else { "" },
                    if user.is_active {
                        style("active").green()
                    } else {
                        style("inactive").dim()
                    }
                );
            }
        }
    }
    Ok(())
}

pub fn wallet(config: AppConfig, command: WalletCommand) -> Result<()> {
    let db = open_store(&config)?;
    let vault = config.vault()?;
    match command {
        WalletCommand::Add {
            user_id,
            name,
            wallet_type,
            description,
            user_address,
            signer_address,
        } => {
            if db.get_user(user_id)?.is_none() {
                bail!("user {user_id} not found");
            }
            let theme = ColorfulTheme::default();
            let prompt_secret = |label: &str| -> Result<SecretString> {
                let value = Password::with_theme(&theme).with_prompt(label).interact()?;
                Ok(SecretString::from(value))
            };
            let credentials = match wallet_type {
                WalletType::Spot => WalletCredentials::Spot {
                    api_key: prompt_secret("API key")?,
                    secret_key: prompt_secret("Secret key")?,
                },
                WalletType::Futures => WalletCredentials::Futures {
                    user_address: user_address
                        .ok_or_else(|| anyhow!("--user-address is required for futures wallets"))?,
                    signer_address: signer_address.ok_or_else(|| {
                        anyhow!("--signer-address is required for futures wallets")
                    })?,
                    private_key: prompt_secret("Signer private key")?,
                },
            };
            let wallet_id = db.create_wallet(
                &vault,
                &NewWallet {
                    user_id,
                    name,
                    description,
                    credentials,
                },
            )?;
            let wallet = db
                .get_wallet(wallet_id)?
                .ok_or_else(|| anyhow!("wallet {wallet_id} vanished after insert"))?;
            let masked = vault.mask(&wallet);
            println!("{} wallet {}", style("Created").bold().green(), wallet_id);
            println!("{}", serde_json::to_string_pretty(&masked)?);
        }
        WalletCommand::List { user_id } => {
            let service = task_service(&config)?;
            for masked in service.masked_wallets(&vault, user_id)? {
                println!(
                    "{:>4}  {:<16} {:<8} api_key={} user_address={}",
                    masked.id,
                    masked.name,
                    masked.wallet_type.as_str(),
                    masked.api_key.as_deref().unwrap_or("-"),
                    masked.user_address.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

pub fn strategy(config: AppConfig, command: StrategyCommand) -> Result<()> {
    let db = open_store(&config)?;
    match command {
        StrategyCommand::Add {
            name,
            strategy_type,
            wallet_types,
            description,
            defaults,
        } => {
            let registry = StrategyRegistry::builtin();
            if !registry.contains(&strategy_type) {
                bail!(
                    "strategy type {strategy_type} is not registered (known: {})",
                    registry.tags().join(", ")
                );
            }
            let default_parameters = defaults.unwrap_or_else(|| serde_json::json!({}));
            if !default_parameters.is_object() {
                bail!("--defaults must be a JSON object");
            }
            let strategy_id = db.create_strategy(&NewStrategy {
                name: name.clone(),
                description,
                strategy_type,
                supported_wallet_types: wallet_types,
                default_parameters,
            })?;
            println!(
                "{} strategy {} ({})",
                style("Created").bold().green(),
                style(&name).cyan(),
                strategy_id
            );
        }
        StrategyCommand::List => {
            for strategy in db.list_strategies()? {
                let wallet_types: Vec<&str> = strategy
                    .supported_wallet_types
                    .iter()
                    .map(WalletType::as_str)
                    .collect();
                println!(
                    "{:>4}  {:<20} type={:<10} wallets={}",
                    strategy.id,
                    strategy.name,
                    strategy.strategy_type,
                    wallet_types.join(",")
                );
            }
        }
    }
    Ok(())
}

pub fn task(config: AppConfig, command: TaskCommand) -> Result<()> {
    let service = task_service(&config)?;
    match command {
        TaskCommand::Create(args) => {
            let task_id = service.create_task(&NewTask {
                user_id: args.user_id,
                wallet_id: args.wallet_id,
                strategy_id: args.strategy_id,
                name: args.name.clone(),
                description: args.description,
                params: TaskParams {
                    symbol: args.symbol,
                    quantity: args.quantity,
                    interval_secs: args.interval,
                    rounds: args.rounds,
                    leverage: args.leverage,
                    side: args.side,
                    order_type: args.order_type,
                },
                strategy_parameters: args.params.unwrap_or_else(|| serde_json::json!({})),
            })?;
            println!(
                "{} task {} ({})",
                style("Created").bold().green(),
                style(&args.name).cyan(),
                task_id
            );
        }
        TaskCommand::Delete { task_id } => {
            service.delete_task(task_id)?;
            println!("{} task {}", style("Deleted").bold().green(), task_id);
        }
    }
    Ok(())
}

pub fn system_config(config: AppConfig, command: ConfigCommand) -> Result<()> {
    let db = open_store(&config)?;
    match command {
        ConfigCommand::Set {
            key,
            value,
            value_type,
            description,
        } => {
            let value = normalize_config_value(&value, value_type)?;
            db.set_config_value(&key, &value, value_type, description.as_deref())?;
            println!("{} {} = {}", style("Set").bold().green(), key, value);
        }
        ConfigCommand::Get { key } => match db.get_config_value(&key)? {
            Some(entry) => println!(
                "{} = {} ({})",
                entry.key,
                entry.value.as_deref().unwrap_or(""),
                entry.value_type.as_str()
            ),
            None => println!("{}", style(format!("{key} is not set")).yellow()),
        },
    }
    Ok(())
}

fn normalize_config_value(value: &str, value_type: ConfigValueType) -> Result<String> {
    let value = value.trim();
    match value_type {
        ConfigValueType::String => Ok(value.to_string()),
        ConfigValueType::Integer => value
            .parse::<i64>()
            .map(|parsed| parsed.to_string())
            .with_context(|| format!("{value} is not an integer")),
        ConfigValueType::Boolean => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok("true".to_string()),
            "false" | "0" | "no" | "off" => Ok("false".to_string()),
            _ => Err(anyhow!("{value} is not a boolean")),
        },
    }
}

fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|err| anyhow!("encode salt: {err}"))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("hash password: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{PasswordHash, PasswordVerifier};

    #[test]
    fn test_hash_password_verifies() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        let parsed = PasswordHash::new(&hash).unwrap();
        assert!(Argon2::default().verify_password(b"correct horse", &parsed).is_ok());
        assert!(Argon2::default().verify_password(b"wrong", &parsed).is_err());
    }

    #[test]
    fn test_config_values_are_normalized_by_type() {
        assert_eq!(
            normalize_config_value(" YES ", ConfigValueType::Boolean).unwrap(),
            "true"
        );
        assert_eq!(
            normalize_config_value("007", ConfigValueType::Integer).unwrap(),
            "7"
        );
        assert!(normalize_config_value("maybe", ConfigValueType::Boolean).is_err());
        assert!(normalize_config_value("1.5", ConfigValueType::Integer).is_err());
    }
}
