use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use rpc_transport::EndpointConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::topic::{TopicScheme, validate_segment};

pub const RPC_NAMESPACE: &str = "RPC_NAMESPACE";
pub const RPC_HOST: &str = "RPC_HOST";
pub const RPC_PORT: &str = "RPC_PORT";
pub const RPC_USERNAME: &str = "RPC_USERNAME";
pub const RPC_PASSWORD: &str = "RPC_PASSWORD";
pub const RPC_CLIENT_ID: &str = "RPC_CLIENT_ID";
pub const RPC_TOPIC_ROOT: &str = "RPC_TOPIC_ROOT";
pub const RPC_RETRY_DELAY_MS: &str = "RPC_RETRY_DELAY_MS";
pub const RPC_TIMEOUT_MS: &str = "RPC_TIMEOUT_MS";

pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Where connection settings are read from. Stores are read-only and
/// serialisable so a host can persist which one it was configured with.
#[async_trait]
#[typetag::serde(tag = "store")]
pub trait SettingsStore: Send + Sync {
    async fn read(&self, key: &str) -> Option<String>;
    fn box_clone(&self) -> Box<dyn SettingsStore>;
    fn describe(&self) -> String;
}

/// Owning handle on a [`SettingsStore`].
#[derive(Serialize, Deserialize)]
pub struct SettingsSource(pub Box<dyn SettingsStore>);

impl SettingsSource {
    pub fn new(store: Box<dyn SettingsStore>) -> Self {
        Self(store)
    }

    pub async fn read(&self, key: &str) -> Option<String> {
        self.0.read(key).await
    }

    /// Missing and blank values are both `None`.
    async fn non_empty(&self, key: &str) -> Option<String> {
        self.read(key)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    async fn parsed<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.non_empty(key).await {
            None => Ok(default),
            Some(raw) => raw
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key}={raw}: {e}")),
        }
    }
}

impl Clone for SettingsSource {
    fn clone(&self) -> Self {
        Self(self.0.box_clone())
    }
}

impl std::fmt::Debug for SettingsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.describe())
    }
}

/// Process environment, seeded from and written back to a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvSettings {
    env_file: PathBuf,
}

impl EnvSettings {
    pub fn load(env_file: impl Into<PathBuf>) -> Box<Self> {
        let env_file = env_file.into();
        if !env_file.exists() {
            warn!(path = %env_file.display(), "no env file, reading the process environment only");
        } else if let Err(e) = dotenvy::from_path(&env_file) {
            warn!(path = %env_file.display(), "env file not loaded: {e}");
        } else {
            info!(path = %env_file.display(), "env file loaded");
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde(name = "env")]
#[async_trait]
impl SettingsStore for EnvSettings {
    async fn read(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn box_clone(&self) -> Box<dyn SettingsStore> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("env settings ({})", self.env_file.display())
    }
}

/// In-memory settings, used by tests and embedders.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapSettings {
    values: BTreeMap<String, String>,
}

impl MapSettings {
    pub fn empty() -> Box<Self> {
        Box::default()
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Box<Self> {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Box::new(Self { values })
    }
}

#[typetag::serde(name = "map")]
#[async_trait]
impl SettingsStore for MapSettings {
    async fn read(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn box_clone(&self) -> Box<dyn SettingsStore> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("map settings ({} keys)", self.values.len())
    }
}

/// Everything a connection needs, resolved from a [`SettingsSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionSettings {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_root: Option<String>,
    pub endpoint: EndpointConfig,
    /// Backoff before the single reconnect attempt after a transport error.
    pub retry_delay_ms: u64,
    /// Applied to calls that do not pass their own timeout; 0 means none.
    pub default_timeout_ms: u64,
}

impl ConnectionSettings {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            topic_root: None,
            endpoint: EndpointConfig::default(),
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            default_timeout_ms: 0,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_topic_root(mut self, root: impl Into<String>) -> Self {
        self.topic_root = Some(root.into());
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }

    pub fn scheme(&self) -> Result<TopicScheme, crate::error::RpcError> {
        TopicScheme::with_root(self.topic_root.as_deref(), &self.namespace)
    }

    pub async fn from_source(config: &SettingsSource) -> anyhow::Result<Self> {
        let Some(namespace) = config.non_empty(RPC_NAMESPACE).await else {
            bail!("{RPC_NAMESPACE} is not set");
        };
        validate_segment("namespace", &namespace).context("invalid RPC_NAMESPACE")?;

        let host = config
            .non_empty(RPC_HOST)
            .await
            .unwrap_or_else(|| "localhost".to_string());
        let mut endpoint = EndpointConfig::new(host, config.parsed(RPC_PORT, 1883u16).await?);
        if let Some(username) = config.non_empty(RPC_USERNAME).await {
            let password = config.read(RPC_PASSWORD).await.unwrap_or_default();
            endpoint = endpoint.with_credentials(username, password);
        }
        if let Some(client_id) = config.non_empty(RPC_CLIENT_ID).await {
            endpoint = endpoint.with_client_id(client_id);
        }

        let settings = Self {
            namespace,
            topic_root: config.non_empty(RPC_TOPIC_ROOT).await,
            endpoint,
            retry_delay_ms: config.parsed(RPC_RETRY_DELAY_MS, DEFAULT_RETRY_DELAY_MS).await?,
            default_timeout_ms: config.parsed(RPC_TIMEOUT_MS, 0u64).await?,
        };
        settings.scheme().context("invalid RPC_TOPIC_ROOT")?;
        Ok(settings)
    }
}
