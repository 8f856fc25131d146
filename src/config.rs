//! JSON configuration file

use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

use crate::{
    bridge::BridgeOptions,
    connection::Credentials,
    constants::{
        DEFAULT_AMI_PORT, DEFAULT_COMMAND_QUEUE_SIZE, DEFAULT_EVICT_PERIOD_SECS,
        DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_REPLY_TIMEOUT_MS, DEFAULT_SETTLE_MS,
    },
    correlation::CorrelationPolicy,
    error::{BridgeError, BridgeResult},
};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ami: AmiConfig,
    pub main: HttpConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Upstream manager interface.
#[derive(Clone, Deserialize)]
pub struct AmiConfig {
    pub host: String,
    #[serde(default = "default_ami_port", deserialize_with = "port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AmiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl AmiConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }
}

/// HTTP listener.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub interface: String,
    #[serde(deserialize_with = "port")]
    pub port: u16,
}

/// How results are correlated back to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    #[default]
    Acknowledge,
    Settle,
}

/// Optional tunables; every key falls back to its default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub correlation: CorrelationMode,
    pub settle_ms: u64,
    pub reply_timeout_ms: u64,
    pub linger_ms: u64,
    pub queue_size: usize,
    pub evict_period_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            correlation: CorrelationMode::default(),
            settle_ms: DEFAULT_SETTLE_MS,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            linger_ms: 0,
            queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            evict_period_secs: DEFAULT_EVICT_PERIOD_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

impl BridgeConfig {
    pub fn options(&self) -> BridgeOptions {
        let correlation = match self.correlation {
            CorrelationMode::Acknowledge => CorrelationPolicy::Acknowledge {
                linger: Duration::from_millis(self.linger_ms),
            },
            CorrelationMode::Settle => CorrelationPolicy::Settle(Duration::from_millis(self.settle_ms)),
        };
        BridgeOptions {
            correlation,
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            queue_size: self.queue_size,
            evict_period: Duration::from_secs(self.evict_period_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl Config {
    /// Parse configuration from JSON text.
    pub fn from_json(text: &str) -> BridgeResult<Self> {
        let config: Config = serde_json::from_str(text)
            .map_err(|e| BridgeError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    fn validate(&self) -> BridgeResult<()> {
        if self
            .ami
            .host
            .trim()
            .is_empty()
        {
            return Err(BridgeError::config("ami.host is empty"));
        }
        if self.bridge.queue_size == 0 {
            return Err(BridgeError::config("bridge.queue_size must be at least 1"));
        }
        if self.bridge.evict_period_secs == 0 {
            return Err(BridgeError::config(
                "bridge.evict_period_secs must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_ami_port() -> u16 {
    DEFAULT_AMI_PORT
}

/// Ports are written either as `"5038"` or `5038`.
fn port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {:?}", s))),
    }
}
