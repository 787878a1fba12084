//! Configuration system for Strata.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $STRATA_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/strata/config.toml
//!   3. ~/.config/strata/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub peers: PeersConfig,
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Application name announced in the handshake.
    pub name: String,
    /// Light clients do not serve full historical data.
    pub light_client: bool,
    /// Addresses that identify this node. Requests from them are refused.
    pub self_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the peer endpoint binds to.
    pub listen_addr: String,
    /// Maximum number of admitted inbound peers.
    pub max_inbound_peers: usize,
    /// Largest accepted request body.
    pub max_request_bytes: usize,
    /// Concurrent inbound requests. 0 = 4 × available CPUs.
    pub request_workers: usize,
    /// Timeout for outbound peer requests.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Where downloadable files live and downloads are written.
    pub storage_path: PathBuf,
    /// Peers downloaded from concurrently.
    pub parallelism: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Persist the blacklist here. An empty path keeps it in memory only.
    pub blacklist_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Snapshot file to download on startup.
    pub file_id: Option<String>,
    /// Peer endpoints (host:port) to download from.
    pub peers: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Default transfer parallelism.
pub const DEFAULT_PARALLELISM: usize = 6;

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "strata".to_string(),
            light_client: false,
            self_addresses: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7874".to_string(),
            max_inbound_peers: 64,
            max_request_bytes: crate::wire::MAX_REQUEST_BYTES,
            request_workers: 0,
            request_timeout_secs: 30,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            storage_path: data_dir().join("files"),
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            blacklist_path: Some(data_dir().join("blacklist.json")),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("strata")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("strata")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl StrataConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            StrataConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("STRATA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StrataConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Effective number of concurrent inbound requests.
    pub fn request_workers(&self) -> usize {
        if self.network.request_workers > 0 {
            return self.network.request_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 4
    }

    /// Where the blacklist is persisted, if anywhere.
    pub fn blacklist_path(&self) -> Option<&Path> {
        self.peers
            .blacklist_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Apply STRATA_SECTION__KEY env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, keyed by env var name. Values that do
    /// not parse are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = lookup("STRATA_NODE__NAME") {
            self.node.name = v;
        }
        if let Some(v) = lookup("STRATA_NODE__LIGHT_CLIENT") {
            self.node.light_client = v == "true" || v == "1";
        }
        if let Some(v) = lookup("STRATA_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(n) = parsed(lookup("STRATA_NETWORK__MAX_INBOUND_PEERS")) {
            self.network.max_inbound_peers = n;
        }
        if let Some(n) = parsed(lookup("STRATA_NETWORK__MAX_REQUEST_BYTES")) {
            self.network.max_request_bytes = n;
        }
        if let Some(n) = parsed(lookup("STRATA_NETWORK__REQUEST_WORKERS")) {
            self.network.request_workers = n;
        }
        if let Some(n) = parsed(lookup("STRATA_NETWORK__REQUEST_TIMEOUT_SECS")) {
            self.network.request_timeout_secs = n;
        }
        if let Some(v) = lookup("STRATA_TRANSFER__STORAGE_PATH") {
            self.transfer.storage_path = PathBuf::from(v);
        }
        if let Some(n) = parsed(lookup("STRATA_TRANSFER__PARALLELISM")) {
            self.transfer.parallelism = n;
        }
        if let Some(v) = lookup("STRATA_PEERS__BLACKLIST_PATH") {
            self.peers.blacklist_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("STRATA_BOOTSTRAP__FILE_ID") {
            self.bootstrap.file_id = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("STRATA_BOOTSTRAP__PEERS") {
            self.bootstrap.peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
}
