/*
[INPUT]:  YAML configuration file, ASTER_AUTO__* environment overrides
[OUTPUT]: Parsed AppConfig sections for store, vault, proxy, supervisor and runner
[POS]:    Configuration layer - shared by the orchestrator and execution units
[UPDATE]: When adding new configuration options
*/

use anyhow::{Context, Result, anyhow};
use aster_auto_core::CredentialVault;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the config file path, also handed to execution units.
pub const CONFIG_ENV: &str = "ASTER_AUTO_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "aster-auto.yaml";
const ENV_PREFIX: &str = "ASTER_AUTO";

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub vault: VaultConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VaultConfig {
    /// 32-byte key, base64 encoded or raw.
    #[serde(deserialize_with = "secret")]
    pub master_key: SecretString,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub premium: PremiumProxyConfig,
    /// Static development proxy, e.g. `socks5://127.0.0.1:7890`.
    #[serde(default)]
    pub dev_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PremiumKind {
    Residential,
    Datacenter,
}

#[derive(Debug, Deserialize)]
pub struct PremiumProxyConfig {
    /// Fallback when the `smartproxy_enabled` row is absent from system_config.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_username: String,
    #[serde(default, deserialize_with = "optional_secret")]
    pub password: Option<SecretString>,
    #[serde(default = "default_premium_host")]
    pub host: String,
    #[serde(default = "default_premium_port")]
    pub port: u16,
    #[serde(default = "default_premium_kind")]
    pub kind: PremiumKind,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_session_minutes")]
    pub session_duration_minutes: u64,
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default = "default_proxy_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PremiumProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_username: String::new(),
            password: None,
            host: default_premium_host(),
            port: default_premium_port(),
            kind: default_premium_kind(),
            country: default_country(),
            session_duration_minutes: default_session_minutes(),
            probe_url: None,
            timeout_ms: default_proxy_timeout_ms(),
        }
    }
}

impl PremiumProxyConfig {
    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session_duration_minutes * 60)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Execution unit binary; the current executable when unset.
    #[serde(default)]
    pub runner_program: Option<PathBuf>,
    #[serde(default = "default_runner_args")]
    pub runner_args: Vec<String>,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runner_program: None,
            runner_args: default_runner_args(),
            grace_period_ms: default_grace_period_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_round_grace_ms")]
    pub round_grace_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            round_grace_ms: default_round_grace_ms(),
        }
    }
}

impl RunnerConfig {
    pub fn round_grace(&self) -> Duration {
        Duration::from_millis(self.round_grace_ms)
    }
}

impl AppConfig {
    /// Load the YAML file at `path`, then apply `ASTER_AUTO__SECTION__KEY` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("read config {}", path.display()))?;

        let config: Self = settings
            .try_deserialize()
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.vault()?;
        if self.supervisor.grace_period_ms == 0 {
            return Err(anyhow!("supervisor.grace_period_ms must be greater than 0"));
        }
        if self.supervisor.kill_timeout_ms == 0 {
            return Err(anyhow!("supervisor.kill_timeout_ms must be greater than 0"));
        }
        if self.proxy.premium.timeout_ms == 0 {
            return Err(anyhow!("proxy.premium.timeout_ms must be greater than 0"));
        }
        if let Some(dev_url) = &self.proxy.dev_url {
            url::Url::parse(dev_url).with_context(|| format!("invalid proxy.dev_url {dev_url}"))?;
        }
        Ok(())
    }

    pub fn vault(&self) -> Result<CredentialVault> {
        use secrecy::ExposeSecret;
        CredentialVault::from_config_value(self.vault.master_key.expose_secret())
            .context("load vault.master_key")
    }
}

/// `--config` wins, then `ASTER_AUTO_CONFIG`, then `aster-auto.yaml`.
pub fn resolve_config_path(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

fn optional_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|value| !value.is_empty())
        .map(SecretString::from))
}

fn default_database_path() -> PathBuf {
    PathBuf::from("aster-auto.db")
}

fn default_premium_host() -> String {
    "gate.decodo.com".to_string()
}

fn default_premium_port() -> u16 {
    10001
}

fn default_premium_kind() -> PremiumKind {
    PremiumKind::Residential
}

fn default_country() -> String {
    "us".to_string()
}

fn default_session_minutes() -> u64 {
    60
}

fn default_proxy_timeout_ms() -> u64 {
    3000
}

fn default_runner_args() -> Vec<String> {
    vec!["run-task".to_string()]
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_kill_timeout_ms() -> u64 {
    3000
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("task_logs")
}

fn default_round_grace_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = "vault:\n  master_key: \"0123456789abcdef0123456789abcdef\"\n";

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config(MINIMAL);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.database.path, PathBuf::from("aster-auto.db"));
        assert_eq!(config.supervisor.runner_args, vec!["run-task".to_string()]);
        assert_eq!(config.supervisor.grace_period(), Duration::from_secs(5));
        assert_eq!(config.proxy.premium.kind, PremiumKind::Residential);
        assert_eq!(config.proxy.premium.session_duration(), Duration::from_secs(3600));
        assert!(config.proxy.dev_url.is_none());
        assert!(config.vault().is_ok());
    }

    #[test]
    fn test_full_config_parses() {
        let file = write_config(
            r#"
database:
  path: /var/lib/aster/aster.db
vault:
  master_key: "0123456789abcdef0123456789abcdef"
proxy:
  dev_url: "socks5://127.0.0.1:7890"
  premium:
    enabled: true
    base_username: sp-user
    password: hunter2
    kind: datacenter
    timeout_ms: 1500
supervisor:
  runner_program: /usr/local/bin/aster-auto
  grace_period_ms: 800
runner:
  log_dir: /tmp/aster-logs
"#,
        );
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.database.path, PathBuf::from("/var/lib/aster/aster.db"));
        assert!(config.proxy.premium.enabled);
        assert_eq!(config.proxy.premium.kind, PremiumKind::Datacenter);
        assert!(config.proxy.premium.password.is_some());
        assert_eq!(config.proxy.premium.timeout(), Duration::from_millis(1500));
        assert_eq!(config.supervisor.grace_period_ms, 800);
        assert_eq!(config.supervisor.kill_timeout_ms, 3000);
        assert_eq!(config.runner.round_grace_ms, 2000);
    }

    #[test]
    fn test_short_master_key_is_rejected() {
        let file = write_config("vault:\n  master_key: short\n");
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_secrets_are_not_debug_printed() {
        let file = write_config(MINIMAL);
        let config = AppConfig::load(file.path()).unwrap();
        assert!(!format!("{config:?}").contains("0123456789abcdef"));
    }
}
