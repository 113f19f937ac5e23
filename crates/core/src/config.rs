use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Model pack settings
    #[serde(default)]
    pub pack: PackConfig,

    /// Download settings
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Model store root (default: <local data dir>/models)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackConfig {
    /// Manifest describing the expected models (default: <config dir>/manifest.toml)
    #[serde(default = "default_manifest_path")]
    pub manifest: PathBuf,

    /// Overrides the pack URL declared in the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Seconds to wait for the server to accept the connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "modelpack").context("Could not determine home directory")
}

fn default_store_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_local_dir().join("models"))
        .unwrap_or_else(|_| PathBuf::from("models"))
}

fn default_manifest_path() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("manifest.toml"))
        .unwrap_or_else(|_| PathBuf::from("manifest.toml"))
}

fn default_user_agent() -> String {
    format!("modelpack/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest_path(),
            url: None,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Get the base config directory, e.g. ~/.config/modelpack/
    pub fn base_dir() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().to_path_buf())
    }

    /// Load config from default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from `path`, defaults if the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the config file path: <config dir>/config.toml
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Get the model store root from config
    pub fn store_dir(&self) -> PathBuf {
        self.store.path.clone()
    }

    /// Get the logs directory: <local data dir>/logs/
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(project_dirs()?.data_local_dir().join("logs"))
    }
}
