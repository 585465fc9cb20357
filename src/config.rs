//! Configuration module for batch-connector.
//!
//! Two layers live here:
//! - [`ServerConfig`]: process wiring, loaded from environment variables.
//! - [`RuntimeConfig`]: listen credentials and proxy settings, kept in a JSON
//!   file and served through the read/write guarded [`ConfigStore`].

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

pub const DEFAULT_PASSWORD: &str = "admin123";
pub const DEFAULT_LISTEN_PORT: &str = "18921";
pub const DEFAULT_PROXY_TYPE: &str = "socks5";

const DEFAULT_CONFIG_FILE: &str = "config.json";
const DEFAULT_DB_FILE: &str = "connections.db";

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode config: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config is missing")]
    Missing,
    #[error("invalid listen port: {0:?}")]
    InvalidPort(String),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the JSON runtime settings (default: "config.json")
    pub config_path: PathBuf,
    /// Path to the SQLite database file (default: "connections.db" next to the executable)
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_FILE),
            db_path: default_db_path(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BATCH_CONNECTOR_CONFIG`: runtime settings file (default: "config.json")
    /// - `BATCH_CONNECTOR_DB_PATH`: database file path (default: next to the executable)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("BATCH_CONNECTOR_CONFIG") {
            if !path.is_empty() {
                cfg.config_path = PathBuf::from(path);
            }
        }

        if let Ok(path) = env::var("BATCH_CONNECTOR_DB_PATH") {
            if !path.is_empty() {
                cfg.db_path = PathBuf::from(path);
            }
        }

        cfg
    }
}

/// Database file next to the running executable, or in the working
/// directory when the executable path cannot be determined.
pub fn default_db_path() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_DB_FILE)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE))
}

/// Outbound proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub host: String,
    pub port: String,
    pub user: String,
    pub pass: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_type: DEFAULT_PROXY_TYPE.to_string(),
            host: String::new(),
            port: String::new(),
            user: String::new(),
            pass: String::new(),
        }
    }
}

/// Runtime settings persisted in the JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub password: String,
    #[serde(rename = "port")]
    pub listen_port: String,
    pub proxy: ProxyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            password: DEFAULT_PASSWORD.to_string(),
            listen_port: DEFAULT_LISTEN_PORT.to_string(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Fill empty required fields with their defaults.
    pub fn normalize(&mut self) {
        if self.listen_port.is_empty() {
            self.listen_port = DEFAULT_LISTEN_PORT.to_string();
        }
        if self.password.is_empty() {
            self.password = DEFAULT_PASSWORD.to_string();
        }
        if self.proxy.proxy_type.is_empty() {
            self.proxy.proxy_type = DEFAULT_PROXY_TYPE.to_string();
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// The listen port as a number, for binding the API server.
    pub fn listen_port_number(&self) -> Result<u16, ConfigError> {
        self.listen_port
            .parse()
            .map_err(|_| ConfigError::InvalidPort(self.listen_port.clone()))
    }

    /// Read settings from `path`. A missing file yields the defaults.
    pub fn read_from(path: &Path) -> Result<Self, ConfigError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let cfg: Self = serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(cfg.normalized())
    }

    /// Write settings to `path` as indented JSON, readable by the owner only.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(self).map_err(ConfigError::Encode)?;
        write_private(path, &data).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Read/write guarded holder of the current [`RuntimeConfig`].
///
/// Published values are never mutated: a save builds a new value and swaps
/// the `Arc`, so readers holding an older snapshot keep a consistent view.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Option<Arc<RuntimeConfig>>>,
}

impl ConfigStore {
    /// Create a store backed by `path`. Nothing is read until first use.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(None),
        }
    }

    /// Create a store and load it immediately.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    /// Create a store with an injected value; the file is only touched on save/reload.
    pub fn with_config<P: AsRef<Path>>(path: P, cfg: RuntimeConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(Some(Arc::new(cfg.normalized()))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the cached config, reading the backing file on first use.
    pub fn load(&self) -> Result<Arc<RuntimeConfig>, ConfigError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(cfg) = current.as_ref() {
            return Ok(cfg.clone());
        }

        let cfg = Arc::new(RuntimeConfig::read_from(&self.path)?);
        tracing::info!("Loaded runtime config from {}", self.path.display());
        *current = Some(cfg.clone());
        Ok(cfg)
    }

    /// Read the cached config, falling back to [`ConfigStore::load`] if nothing is cached yet.
    pub fn get(&self) -> Result<Arc<RuntimeConfig>, ConfigError> {
        {
            let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cfg) = current.as_ref() {
                return Ok(cfg.clone());
            }
        }
        self.load()
    }

    /// Re-read the backing file. On failure the previous value stays in place.
    /// The write lock is held across the read so a concurrent save cannot be
    /// replaced by the older file contents.
    pub fn reload(&self) -> Result<Arc<RuntimeConfig>, ConfigError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let cfg = Arc::new(RuntimeConfig::read_from(&self.path)?);
        *current = Some(cfg.clone());
        drop(current);

        tracing::info!("Reloaded runtime config from {}", self.path.display());
        Ok(cfg)
    }

    /// Normalize, persist and publish `cfg`.
    pub fn save(&self, cfg: RuntimeConfig) -> Result<Arc<RuntimeConfig>, ConfigError> {
        let cfg = Arc::new(cfg.normalized());

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        cfg.write_to(&self.path)?;
        *current = Some(cfg.clone());
        drop(current);

        tracing::info!(
            "Saved runtime config to {} (proxy enabled: {})",
            self.path.display(),
            cfg.proxy.enabled
        );
        Ok(cfg)
    }
}
