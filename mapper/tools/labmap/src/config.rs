use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::Context as _;
use labmap_core::{Credentials, EntityKind, Hint, Timeouts, keys};
use serde::Deserialize;
use tracing::warn;

/// Scan configuration loaded from YAML. Secrets never live in the file;
/// credentials reference environment variables by name.
#[derive(Debug, Deserialize)]
pub struct ScanConfig {
    pub subnets: Vec<String>,
    #[serde(default)]
    pub gateway_ip: Option<String>,
    /// Endpoint serving the gateway's DHCP leases as JSON, usually an
    /// external scraper.
    #[serde(default)]
    pub lease_url: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub hints: Vec<HintConfig>,
    #[serde(default)]
    pub credentials: Vec<CredentialRef>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub ping_ms: u64,
    pub probe_per_port_ms: u64,
    pub http_ms: u64,
    pub adapter_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let defaults = Timeouts::default();
        Self {
            ping_ms: defaults.ping.as_millis() as u64,
            probe_per_port_ms: defaults.probe_per_port.as_millis() as u64,
            http_ms: defaults.http.as_millis() as u64,
            adapter_ms: defaults.adapter.as_millis() as u64,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            ping: Duration::from_millis(self.ping_ms),
            probe_per_port: Duration::from_millis(self.probe_per_port_ms),
            http: Duration::from_millis(self.http_ms),
            adapter: Duration::from_millis(self.adapter_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub dir: PathBuf,
    pub retain: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("history"),
            retain: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HintConfig {
    pub ip: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<EntityKind>,
    #[serde(default)]
    pub token_env: Option<String>,
}

impl HintConfig {
    #[must_use]
    pub fn to_hint(&self) -> Hint {
        Hint {
            ip: self.ip.clone(),
            port: self.port,
            name: self.name.clone(),
            kind: self.kind,
            token_env_key: self.token_env.clone(),
        }
    }
}

/// `(service, key)` credential filled from the named environment variable.
#[derive(Debug, Deserialize)]
pub struct CredentialRef {
    pub service: String,
    pub key: String,
    pub env: String,
}

impl ScanConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Self = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config file {path}"))?;
        anyhow::ensure!(!config.subnets.is_empty(), "config lists no subnets");
        Ok(config)
    }

    /// Resolve every referenced environment variable into the credential
    /// store. Missing variables are logged and skipped; the affected
    /// adapter will fail verification on its own.
    #[must_use]
    pub fn resolve_credentials(&self) -> Credentials {
        let mut creds = Credentials::new();
        for reference in &self.credentials {
            match env::var(&reference.env) {
                Ok(value) => creds.insert(&reference.service, &reference.key, value),
                Err(_) => {
                    warn!(env = %reference.env, service = %reference.service, "credential variable not set");
                }
            }
        }
        for hint in &self.hints {
            if let Some(env_key) = &hint.token_env
                && let Ok(value) = env::var(env_key)
            {
                creds.insert(keys::HINT_TOKEN_ENV, &hint.ip, value);
            }
        }
        creds
    }
}
