use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::{
    fs,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::classify::BinaryEncoding;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub websocket: WebSocketConfig,
    pub ipc: IpcConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub host: String,
    pub port_start: u16,
    pub port_end: u16,
    /// Upper bound for a single upstream dial attempt.
    pub connect_timeout_ms: u64,
    pub tls: Option<TlsConfig>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port_start: 6463,
            port_end: 6472,
            connect_timeout_ms: 3000,
            tls: None,
        }
    }
}

impl WebSocketConfig {
    #[must_use]
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.port_start..=self.port_end
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub enabled: bool,
    /// Directory holding the `<prefix>-<slot>` sockets. Resolved from the
    /// environment when unset.
    pub runtime_dir: Option<PathBuf>,
    pub prefix: String,
    pub slot_start: u16,
    pub slot_end: u16,
    pub connect_timeout_ms: u64,
    /// Replace socket files nobody is listening on instead of skipping the slot.
    pub remove_stale_sockets: bool,
    pub max_frame_len: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            runtime_dir: None,
            prefix: "discord-ipc".to_string(),
            slot_start: 0,
            slot_end: 9,
            connect_timeout_ms: 3000,
            remove_stale_sockets: true,
            max_frame_len: 64 * 1024 * 1024,
        }
    }
}

impl IpcConfig {
    #[must_use]
    pub fn slots(&self) -> RangeInclusive<u16> {
        self.slot_start..=self.slot_end
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(default_runtime_dir)
    }

    #[must_use]
    pub fn socket_path(&self, slot: u16) -> PathBuf {
        self.runtime_dir().join(format!("{}-{slot}", self.prefix))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub binary_encoding: BinaryEncoding,
}

/// `$XDG_RUNTIME_DIR` when set, otherwise the platform temp directory.
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map_or_else(std::env::temp_dir, PathBuf::from)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Loads `path` when given, else `config.toml` if present, else defaults.
pub fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            load_config(Path::new(DEFAULT_CONFIG_FILE))
        }
        None => Ok(Config::default()),
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.websocket.port_start <= self.websocket.port_end,
            "websocket.port_start ({}) must not exceed websocket.port_end ({})",
            self.websocket.port_start,
            self.websocket.port_end
        );
        ensure!(
            self.ipc.slot_start <= self.ipc.slot_end,
            "ipc.slot_start ({}) must not exceed ipc.slot_end ({})",
            self.ipc.slot_start,
            self.ipc.slot_end
        );
        ensure!(!self.ipc.prefix.is_empty(), "ipc.prefix must not be empty");
        ensure!(
            self.websocket.enabled || self.ipc.enabled,
            "at least one of websocket and ipc must be enabled"
        );
        Ok(())
    }
}
