use crate::cli::Args;
use crate::shutdown::DRAIN_TIMEOUT;
use aesd_core::{AesdError, DEFAULT_DATA_FILE, DEFAULT_PORT, DEFAULT_TIMESTAMP_INTERVAL_SECS, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub data_file: PathBuf,
    /// Detach from the controlling terminal after binding
    #[serde(default)]
    pub daemon: bool,
    /// Milliseconds between timestamp records; 0 disables the injector
    #[serde(default = "default_timestamp_interval_ms")]
    pub timestamp_interval_ms: u64,
    /// Grace period for open connections during shutdown
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Upper bound on the dispatch loop's wait between registry reaps
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// Maximum in-flight connections (unbounded when absent)
    #[serde(default)]
    pub max_connections: Option<usize>,
}

fn default_timestamp_interval_ms() -> u64 {
    DEFAULT_TIMESTAMP_INTERVAL_SECS * 1000
}

fn default_drain_timeout_ms() -> u64 {
    DRAIN_TIMEOUT.as_secs() * 1000
}

fn default_reap_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            data_file: PathBuf::from(DEFAULT_DATA_FILE),
            daemon: false,
            timestamp_interval_ms: default_timestamp_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            max_connections: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AesdError::Config(format!("cannot read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Self = match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| AesdError::Config(format!("TOML parse error: {e}")))?,
            "json" => serde_json::from_str(&content)
                .map_err(|e| AesdError::Config(format!("JSON parse error: {e}")))?,
            _ => {
                return Err(AesdError::Config(format!(
                    "Unknown config file extension: {ext}"
                )));
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_args(args: &Args) -> Self {
        Self {
            listen_addr: args.listen,
            data_file: args.data_file.clone(),
            daemon: args.daemon,
            timestamp_interval_ms: args.timestamp_interval_secs.saturating_mul(1000),
            drain_timeout_ms: args.drain_timeout_secs.saturating_mul(1000),
            max_connections: args.max_connections,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_file.as_os_str().is_empty() {
            return Err(AesdError::Config("data_file must not be empty".into()));
        }
        if self.reap_interval_ms == 0 {
            return Err(AesdError::Config("reap_interval_ms must be positive".into()));
        }
        if self.max_connections == Some(0) {
            return Err(AesdError::Config("max_connections must be positive".into()));
        }
        Ok(())
    }

    /// Injector cadence, `None` when disabled
    pub fn timestamp_interval(&self) -> Option<Duration> {
        (self.timestamp_interval_ms > 0).then(|| Duration::from_millis(self.timestamp_interval_ms))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}
