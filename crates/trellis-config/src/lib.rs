// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Configuration for Trellis tools: a serde-typed config record stored as
//! pretty JSON under the platform config directory, with defaults persisted
//! on first run so users have a file to edit.

use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Error type for config operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Key not present in store.
    #[error("not found")]
    NotFound,
    /// I/O error while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Platform directories could not be resolved.
    #[error("could not resolve a platform directory for trellis")]
    NoProjectDirs,
}

/// Storage port for raw config blobs (keyed by logical name).
pub trait ConfigStore {
    /// Load a raw config blob. Returns `NotFound` when missing.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Persist a raw config blob.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Store configs as JSON files under the platform config directory.
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Create a store rooted at the user config directory
    /// (e.g. `~/.config/trellis`).
    pub fn new() -> Result<Self, ConfigError> {
        let proj = project_dirs()?;
        let base = proj.config_dir().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Store rooted at an explicit directory (tests, portable setups).
    pub fn at(base: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

/// Thin service that serializes config values and delegates storage.
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Create a new service using the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Load and deserialize a config value for `key`; `Ok(None)` if missing.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(ConfigError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Serialize and persist a config value for `key`.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

/// Git-backed directory sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Whether the directory-sync loop runs at all.
    pub enabled: bool,
    /// Remote URL (token-authorized form allowed); `None` keeps the loop
    /// local-only (commit but never fetch/push).
    pub remote: Option<String>,
    /// Branch the sync loop owns.
    pub branch: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remote: None,
            branch: "main".to_owned(),
        }
    }
}

/// Realtime channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Whether the realtime client runs at all.
    pub enabled: bool,
    /// Hub address (`host:port`).
    pub hub_addr: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hub_addr: "127.0.0.1:9341".to_owned(),
        }
    }
}

/// Top-level Trellis configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    /// Data root; defaults to the platform data dir when `None`.
    pub data_dir: Option<PathBuf>,
    /// Git sync settings.
    pub git: GitConfig,
    /// Realtime sync settings.
    pub realtime: RealtimeConfig,
    /// Short-id counter width in bytes. Changing this on an existing store
    /// is refused until the store is re-encoded.
    pub short_id_bytes: usize,
    /// Render full UUID tags instead of short ids.
    pub long_ids: bool,
    /// Sort children by id in per-node files (stable diffs across peers
    /// whose insertion orders differ).
    pub sort_file_children: bool,
}

impl Default for TrellisConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            git: GitConfig::default(),
            realtime: RealtimeConfig::default(),
            short_id_bytes: 2,
            long_ids: false,
            sort_file_children: false,
        }
    }
}

/// Config file key under the config directory.
const CONFIG_KEY: &str = "trellis";

impl TrellisConfig {
    /// Loads the configuration, writing defaults on first run.
    pub fn load_or_init() -> Result<Self, ConfigError> {
        Self::load_or_init_with(ConfigService::new(FsConfigStore::new()?))
    }

    /// Same as [`TrellisConfig::load_or_init`] against an explicit store.
    pub fn load_or_init_with<S: ConfigStore>(
        service: ConfigService<S>,
    ) -> Result<Self, ConfigError> {
        if let Some(existing) = service.load::<Self>(CONFIG_KEY)? {
            return Ok(existing);
        }
        let config = Self::default();
        service.save(CONFIG_KEY, &config)?;
        Ok(config)
    }

    /// Resolved data root.
    pub fn data_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }

    /// LMDB environment directory.
    pub fn db_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_root()?.join("db"))
    }

    /// Git working directory (one file per node).
    pub fn git_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_root()?.join("git"))
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("dev", "flyingrobots", "trellis").ok_or(ConfigError::NoProjectDirs)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_run_persists_defaults() {
        let dir = TempDir::new().unwrap();
        let service = ConfigService::new(FsConfigStore::at(dir.path()).unwrap());
        let config = TrellisConfig::load_or_init_with(service).unwrap();
        assert_eq!(config, TrellisConfig::default());
        assert!(dir.path().join("trellis.json").is_file());

        // Second load round-trips the persisted file.
        let service = ConfigService::new(FsConfigStore::at(dir.path()).unwrap());
        let again = TrellisConfig::load_or_init_with(service).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn partial_files_fill_with_defaults() {
        let dir = TempDir::new().unwrap();
        let store = FsConfigStore::at(dir.path()).unwrap();
        store
            .save_raw(CONFIG_KEY, br#"{"long_ids": true}"#)
            .unwrap();
        let config = TrellisConfig::load_or_init_with(ConfigService::new(store)).unwrap();
        assert!(config.long_ids);
        assert_eq!(config.short_id_bytes, 2);
        assert_eq!(config.git.branch, "main");
    }
}
