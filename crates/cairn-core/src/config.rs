//! Runtime configuration for Cairn.
//!
//! One `CairnConfig` is built at supervisor start and passed down
//! explicitly — there is no process-wide test-override state. Test tooling
//! injects values by constructing the struct directly.
//!
//! Resolution order: environment variables → config file → defaults.
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub supervisor: SupervisorConfig,
    pub store: StoreConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory holding the vault config file and per-vault chunkstores.
    pub root_dir: PathBuf,
    /// Loopback listener port. 0 = OS-assigned.
    pub listener_port: u16,
    /// Path to the vault executable. Empty = next to the current executable.
    pub vault_executable: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Memory cache budget in bytes. 0 = unbounded.
    pub cache_capacity: u64,
    /// Permanent store budget in bytes. 0 = unbounded.
    pub permanent_capacity: u64,
    /// Directory-tree depth of the file store.
    pub dir_depth: u32,
    /// Artificial delay for simulated network gets, in milliseconds.
    /// Mutating verbs sleep three times this. 0 = no delay.
    pub simulated_get_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Opaque bootstrap contact list, passed through to vaults untouched.
    pub bootstrap_contacts: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            store: StoreConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            root_dir: data_dir(),
            listener_port: 0,
            vault_executable: PathBuf::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 64 << 20, // 64 MiB
            permanent_capacity: 0,
            dir_depth: 5,
            simulated_get_delay_ms: 0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bootstrap_contacts: Vec::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("cairn")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local").join("share"))
        .join("cairn")
}

fn home_dir() -> PathBuf {
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

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_SUPERVISOR__ROOT_DIR") {
            self.supervisor.root_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CAIRN_SUPERVISOR__LISTENER_PORT") {
            if let Ok(p) = v.parse() {
                self.supervisor.listener_port = p;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_SUPERVISOR__VAULT_EXECUTABLE") {
            self.supervisor.vault_executable = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CAIRN_STORE__CACHE_CAPACITY") {
            if let Ok(c) = v.parse() {
                self.store.cache_capacity = c;
            }
        }
    }

    /// The path of the supervisor's encrypted vault config file.
    pub fn vault_config_path(&self) -> PathBuf {
        self.supervisor.root_dir.join("vaults.cfg")
    }
}
