/*
[INPUT]:  Interactive answers for store location, log directory and dev proxy
[OUTPUT]: Starter YAML configuration with a freshly generated vault master key
[POS]:    CLI initialization layer - runs before any configuration exists
[UPDATE]: When AppConfig gains required sections
*/

use anyhow::{Context, Result, bail};
use aster_auto_core::CredentialVault;
use console::style;
use dialoguer::{Confirm, Input, theme::ColorfulTheme};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
struct ConfigTemplate {
    database: DatabaseSection,
    vault: VaultSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<ProxySection>,
    runner: RunnerSection,
}

#[derive(Debug, Serialize)]
struct DatabaseSection {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
struct VaultSection {
    master_key: String,
}

#[derive(Debug, Serialize)]
struct ProxySection {
    dev_url: String,
}

#[derive(Debug, Serialize)]
struct RunnerSection {
    log_dir: PathBuf,
}

pub fn run_init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite (its master key would be lost)",
            output.display()
        );
    }

    println!("{}", style("aster-auto configuration").bold().cyan());
    println!(
        "{}",
        style("A new vault master key is generated; keep the file private.").dim()
    );

    let theme = ColorfulTheme::default();
    let database: String = Input::with_theme(&theme)
        .with_prompt("Task store path")
        .default("aster-auto.db".to_string())
        .interact_text()?;
    let log_dir: String = Input::with_theme(&theme)
        .with_prompt("Execution unit log directory")
        .default("task_logs".to_string())
        .interact_text()?;
    let dev_url = if Confirm::with_theme(&theme)
        .with_prompt("Route tasks through a development proxy?")
        .default(false)
        .interact()?
    {
        Some(
            Input::<String>::with_theme(&theme)
                .with_prompt("Development proxy URL")
                .default("socks5://127.0.0.1:7890".to_string())
                .interact_text()?,
        )
    } else {
        None
    };

    let yaml = render(
        PathBuf::from(database),
        PathBuf::from(log_dir),
        dev_url,
        CredentialVault::generate_master_key(),
    )?;
    std::fs::write(output, yaml)
        .with_context(|| format!("failed to write config to {}", output.display()))?;

    println!("\n{}", style("Configuration written").bold().green());
    println!("  {}", style(output.display()).cyan());
    Ok(())
}

fn render(
    database: PathBuf,
    log_dir: PathBuf,
    dev_url: Option<String>,
    master_key: String,
) -> Result<String> {
    let template = ConfigTemplate {
        database: DatabaseSection { path: database },
        vault: VaultSection { master_key },
        proxy: dev_url.map(|dev_url| ProxySection { dev_url }),
        runner: RunnerSection { log_dir },
    };
    serde_yaml::to_string(&template).context("failed to serialize config to YAML")
}
