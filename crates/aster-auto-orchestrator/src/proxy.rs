/*
[INPUT]:  ProxyConfig, a PremiumToggle refreshed on every call, task ids
[OUTPUT]: Per-task EgressIdentity (premium sticky session, dev proxy, or none)
[POS]:    Network layer - egress identity leases owned by one task each
[UPDATE]: When adding provider tiers or changing session derivation
*/

use aster_auto_core::types::TaskId;
use aster_auto_core::{Database, SMARTPROXY_ENABLED_KEY};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{PremiumKind, PremiumProxyConfig, ProxyConfig};

const DATACENTER_BASE_PORT: u16 = 10001;
const DATACENTER_PORT_COUNT: i64 = 100;
const PROBE_USER_AGENT: &str = "AsterAuto/1.0";

/// Provider failures. Always absorbed by degrading to the next tier.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("premium proxy credentials are not configured")]
    MissingCredentials,

    #[error("invalid proxy url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("proxy probe failed: {0}")]
    Probe(#[from] reqwest::Error),

    #[error("proxy allocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream identity {endpoint} is already leased to task {holder}")]
    IdentityInUse { endpoint: String, holder: TaskId },
}

/// Source of the operator's premium on/off switch, consulted on every allocation.
pub trait PremiumToggle: Send + Sync {
    /// `None` when no override is stored.
    fn premium_enabled(&self) -> anyhow::Result<Option<bool>>;
}

impl PremiumToggle for Database {
    fn premium_enabled(&self) -> anyhow::Result<Option<bool>> {
        self.get_config_bool(SMARTPROXY_ENABLED_KEY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressTier {
    Premium,
    Development,
}

/// Network identity assigned to one task for the lifetime of its run.
#[derive(Clone)]
pub struct EgressIdentity {
    pub task_id: TaskId,
    pub tier: EgressTier,
    /// Upstream sticky session; `None` for the development proxy.
    pub session_id: Option<String>,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    password: Option<Arc<SecretString>>,
}

impl fmt::Debug for EgressIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EgressIdentity")
            .field("task_id", &self.task_id)
            .field("tier", &self.tier)
            .field("session_id", &self.session_id)
            .field("endpoint", &self.display_url())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl EgressIdentity {
    /// Full proxy URL including credentials. Never log this.
    pub fn proxy_url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => format!(
                "{}://{}:{}@{}:{}",
                self.scheme,
                username,
                password.expose_secret(),
                self.host,
                self.port
            ),
            (Some(username), None) => {
                format!("{}://{}@{}:{}", self.scheme, username, self.host, self.port)
            }
            _ => self.display_url(),
        }
    }

    /// Credential-free endpoint for logs.
    pub fn display_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, ProxyError> {
        let proxy = reqwest::Proxy::all(self.display_url()).map_err(|err| ProxyError::InvalidUrl {
            url: self.display_url(),
            reason: err.to_string(),
        })?;
        Ok(match (&self.username, &self.password) {
            (Some(username), Some(password)) => proxy.basic_auth(username, password.expose_secret()),
            _ => proxy,
        })
    }

    fn from_dev_url(task_id: TaskId, dev_url: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: &str| ProxyError::InvalidUrl {
            url: dev_url.to_string(),
            reason: reason.to_string(),
        };
        let url = url::Url::parse(dev_url).map_err(|err| invalid(&err.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        let username = Some(url.username())
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let password = url
            .password()
            .map(|password| Arc::new(SecretString::from(password.to_string())));

        Ok(Self {
            task_id,
            tier: EgressTier::Development,
            session_id: None,
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port,
            username,
            password,
        })
    }
}

/// Deterministic upstream session id for a task.
pub fn session_id_for(task_id: TaskId) -> String {
    format!("task{task_id:04}")
}

struct Lease {
    identity: EgressIdentity,
    expires_at: Instant,
}

/// Assigns egress identities by tier: premium sticky session, dev proxy, host network.
pub struct ProxySessionAllocator {
    premium: PremiumProxyConfig,
    dev_url: Option<String>,
    toggle: Arc<dyn PremiumToggle>,
    leases: Mutex<HashMap<TaskId, Lease>>,
}

impl fmt::Debug for ProxySessionAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySessionAllocator")
            .field("kind", &self.premium.kind)
            .field("dev_url", &self.dev_url.is_some())
            .finish_non_exhaustive()
    }
}

impl ProxySessionAllocator {
    pub fn new(config: ProxyConfig, toggle: Arc<dyn PremiumToggle>) -> Self {
        Self {
            premium: config.premium,
            dev_url: config.dev_url,
            toggle,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Pick an identity for `task_id`. `None` means the host's default network path.
    ///
    /// Never fails: provider errors degrade to the next tier.
    pub async fn allocate(&self, task_id: TaskId) -> Option<EgressIdentity> {
        if self.premium_enabled().await {
            match tokio::time::timeout(self.premium.timeout(), self.premium_identity(task_id))
                .await
            {
                Ok(Ok(identity)) => return Some(identity),
                Ok(Err(err)) => {
                    warn!(task_id, error = %err, "premium proxy unavailable, degrading")
                }
                Err(_) => {
                    let err = ProxyError::Timeout(self.premium.timeout());
                    warn!(task_id, error = %err, "premium proxy unavailable, degrading");
                }
            }
        }

        if let Some(dev_url) = &self.dev_url {
            match EgressIdentity::from_dev_url(task_id, dev_url) {
                Ok(identity) => {
                    info!(task_id, proxy = %identity.display_url(), "using development proxy");
                    return Some(identity);
                }
                Err(err) => warn!(task_id, error = %err, "development proxy unusable"),
            }
        }

        debug!(task_id, "no proxy assigned, using host network");
        None
    }

    /// Advisory release. Safe to call any number of times.
    pub async fn release(&self, task_id: TaskId) -> bool {
        let released = self.leases.lock().await.remove(&task_id).is_some();
        if released {
            info!(task_id, "proxy session released");
        }
        released
    }

    /// `(task_id, session_id)` for every live premium lease.
    pub async fn active_sessions(&self) -> Vec<(TaskId, String)> {
        let leases = self.leases.lock().await;
        let mut sessions: Vec<_> = leases
            .iter()
            .filter_map(|(task_id, lease)| {
                lease
                    .identity
                    .session_id
                    .clone()
                    .map(|session| (*task_id, session))
            })
            .collect();
        sessions.sort();
        sessions
    }

    async fn premium_enabled(&self) -> bool {
        let toggle = Arc::clone(&self.toggle);
        let fallback = self.premium.enabled;
        match tokio::task::spawn_blocking(move || toggle.premium_enabled()).await {
            Ok(Ok(Some(enabled))) => enabled,
            Ok(Ok(None)) => fallback,
            Ok(Err(err)) => {
                warn!(error = %err, "cannot read premium proxy switch, using config default");
                fallback
            }
            Err(err) => {
                warn!(error = %err, "premium proxy switch lookup panicked");
                fallback
            }
        }
    }

    async fn premium_identity(&self, task_id: TaskId) -> Result<EgressIdentity, ProxyError> {
        {
            let mut leases = self.leases.lock().await;
            if let Some(lease) = leases.get(&task_id) {
                if lease.expires_at > Instant::now() {
                    return Ok(lease.identity.clone());
                }
                debug!(task_id, "premium session expired, renewing");
                leases.remove(&task_id);
            }
        }

        let identity = self.build_premium(task_id)?;
        ensure_unshared(&*self.leases.lock().await, &identity)?;
        if let Some(probe_url) = &self.premium.probe_url {
            self.probe(&identity, probe_url).await?;
        }

        let mut leases = self.leases.lock().await;
        // re-checked: the lock is not held across the probe
        ensure_unshared(&leases, &identity)?;
        info!(
            task_id,
            session = identity.session_id.as_deref().unwrap_or_default(),
            proxy = %identity.display_url(),
            "premium proxy session allocated"
        );
        leases.insert(
            task_id,
            Lease {
                identity: identity.clone(),
                expires_at: Instant::now() + self.premium.session_duration(),
            },
        );
        Ok(identity)
    }

    fn build_premium(&self, task_id: TaskId) -> Result<EgressIdentity, ProxyError> {
        let password = match &self.premium.password {
            Some(password) if !self.premium.base_username.is_empty() => password,
            _ => return Err(ProxyError::MissingCredentials),
        };
        let session_id = session_id_for(task_id);

        let (username, port) = match self.premium.kind {
            PremiumKind::Residential => (
                format!(
                    "user-{}-country-{}-session-{}",
                    self.premium.base_username, self.premium.country, session_id
                ),
                self.premium.port,
            ),
            PremiumKind::Datacenter => {
                // rem_euclid keeps the offset in 0..100, so the cast cannot truncate.
                let offset = task_id.rem_euclid(DATACENTER_PORT_COUNT) as u16;
                (
                    self.premium.base_username.clone(),
                    DATACENTER_BASE_PORT + offset,
                )
            }
        };

        Ok(EgressIdentity {
            task_id,
            tier: EgressTier::Premium,
            session_id: Some(session_id),
            scheme: "http".to_string(),
            host: self.premium.host.clone(),
            port,
            username: Some(username),
            password: Some(Arc::new(SecretString::from(
                password.expose_secret().to_string(),
            ))),
        })
    }

    async fn probe(&self, identity: &EgressIdentity, probe_url: &str) -> Result<(), ProxyError> {
        let client = reqwest::Client::builder()
            .proxy(identity.to_reqwest_proxy()?)
            .timeout(self.premium.timeout())
            .user_agent(PROBE_USER_AGENT)
            .build()?;
        let response = client.get(probe_url).send().await?.error_for_status()?;
        debug!(
            task_id = identity.task_id,
            status = %response.status(),
            "proxy probe succeeded"
        );
        Ok(())
    }
}

/// Datacenter identities repeat every hundred task ids; two live tasks must never share one.
fn ensure_unshared(
    leases: &HashMap<TaskId, Lease>,
    identity: &EgressIdentity,
) -> Result<(), ProxyError> {
    let holder = leases.iter().find(|(task_id, lease)| {
        **task_id != identity.task_id
            && lease.identity.host == identity.host
            && lease.identity.port == identity.port
            && lease.identity.username == identity.username
    });
    match holder {
        Some((holder, _)) => Err(ProxyError::IdentityInUse {
            endpoint: identity.display_url(),
            holder: *holder,
        }),
        None => Ok(()),
    }
}
