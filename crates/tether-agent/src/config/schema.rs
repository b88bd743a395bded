use std::time::Duration;

use serde::Deserialize;
use tether_core::error::{Result, TetherError};
use tether_core::protocol::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub version: u32,

    #[serde(default)]
    pub backend: BackendSection,

    #[serde(default)]
    pub auth: AuthSection,

    #[serde(default)]
    pub queue: QueueSection,

    #[serde(default)]
    pub reconnect: ReconnectSection,

    #[serde(default)]
    pub rpc: RpcSection,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(TetherError::UnsupportedVersion);
        }

        self.backend.validate()?;
        self.auth.validate()?;
        self.queue.validate()?;
        self.reconnect.validate()?;
        self.rpc.validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Idle read timeout. Expiry is not an error, the reader just polls again.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl BackendSection {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TetherError::Config("backend.host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(TetherError::Config("backend.port must not be 0".into()));
        }
        if !(100..=120_000).contains(&self.connect_timeout_ms) {
            return Err(TetherError::Config(
                "backend.connect_timeout_ms must be between 100 and 120000".into(),
            ));
        }
        if self.read_timeout_ms < 100 {
            return Err(TetherError::Config(
                "backend.read_timeout_ms must be at least 100".into(),
            ));
        }
        if !(1..=DEFAULT_MAX_FRAME_BYTES).contains(&self.max_frame_bytes) {
            return Err(TetherError::Config(format!(
                "backend.max_frame_bytes must be between 1 and {DEFAULT_MAX_FRAME_BYTES}"
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_host() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    8765
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    300_000
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_auth_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token: String::new(),
            retry_interval_secs: default_auth_retry_interval_secs(),
        }
    }
}

impl AuthSection {
    pub fn validate(&self) -> Result<()> {
        if self.retry_interval_secs == 0 {
            return Err(TetherError::Config(
                "auth.retry_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

fn default_auth_retry_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    #[serde(default = "default_offer_timeout_ms")]
    pub offer_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            offer_timeout_ms: default_offer_timeout_ms(),
        }
    }
}

impl QueueSection {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TetherError::Config("queue.capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}

fn default_queue_capacity() -> usize {
    5000
}
fn default_offer_timeout_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl ReconnectSection {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_secs == 0 {
            return Err(TetherError::Config(
                "reconnect.initial_delay_secs must be at least 1".into(),
            ));
        }
        if self.max_backoff_secs < self.initial_delay_secs {
            return Err(TetherError::Config(
                "reconnect.max_backoff_secs must be >= initial_delay_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

fn default_initial_delay_secs() -> u64 {
    1
}
fn default_max_backoff_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcSection {
    #[serde(default = "default_rpc_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_rpc_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RpcSection {
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            return Err(TetherError::Config(
                "rpc.default_timeout_secs must be at least 1".into(),
            ));
        }
        if self.sweep_interval_ms < 10 {
            return Err(TetherError::Config(
                "rpc.sweep_interval_ms must be at least 10".into(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_rpc_timeout_secs() -> u64 {
    10
}
fn default_sweep_interval_ms() -> u64 {
    100
}
