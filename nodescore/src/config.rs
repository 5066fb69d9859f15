//! Daemon configuration: JSON file under the XDG config dir, then NODESCORE_* env overrides.
//! Stored at $XDG_CONFIG_HOME/nodescore/config.json (fallback ~/.config/nodescore/config.json)

use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Env { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub scheme: String,
    pub ping_path: String,
    pub speedtest_path: String,
    pub ping_samples: usize,
    pub ping_timeout_ms: u64,
    pub ping_spacing_ms: u64,
    pub speedtest_timeout_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            ping_path: "/ping".into(),
            speedtest_path: "/speedtest".into(),
            ping_samples: 5,
            ping_timeout_ms: 5_000,
            ping_spacing_ms: 100,
            speedtest_timeout_ms: 30_000,
        }
    }
}

impl SamplerConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn ping_spacing(&self) -> Duration {
        Duration::from_millis(self.ping_spacing_ms)
    }

    pub fn speedtest_timeout(&self) -> Duration {
        Duration::from_millis(self.speedtest_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Keep the newest `max_rows` per node in memory.
    Memory { max_rows: usize },
    /// Append one JSON object per sample to `path`.
    Jsonl { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory { max_rows: 1_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interval_secs: u64,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub sampler: SamplerConfig,
    pub store: StoreConfig,
    /// Nodes approved at startup; the registry seed.
    pub nodes: Vec<NodeId>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            port: 3100,
            auth_token: None,
            sampler: SamplerConfig::default(),
            store: StoreConfig::default(),
            nodes: Vec::new(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("nodescore")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nodescore")
    }
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

impl Config {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Explicit path must exist; the default path is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(p) => Self::from_file(p),
            None => {
                let p = config_path();
                if p.exists() {
                    Self::from_file(&p)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(std::env::vars())
    }

    // Split out so tests don't have to touch the process environment.
    pub fn apply_vars<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "NODESCORE_INTERVAL_SECS" => self.interval_secs = parse_env(&key, &value)?,
                "NODESCORE_PORT" => self.port = parse_env(&key, &value)?,
                "NODESCORE_PING_SAMPLES" => self.sampler.ping_samples = parse_env(&key, &value)?,
                "NODESCORE_SPEEDTEST_TIMEOUT_MS" => {
                    self.sampler.speedtest_timeout_ms = parse_env(&key, &value)?
                }
                "NODESCORE_AUTH_TOKEN" => {
                    self.auth_token = Some(value).filter(|v| !v.is_empty());
                }
                "NODESCORE_STORE_PATH" => {
                    self.store = StoreConfig::Jsonl {
                        path: PathBuf::from(value),
                    };
                }
                "NODESCORE_NODES" => {
                    self.nodes = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(NodeId::from)
                        .collect();
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}
