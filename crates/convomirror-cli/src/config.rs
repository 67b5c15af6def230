//! CLI configuration file handling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use convomirror_core::SyncConfig;

/// On-disk configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// Base URL of the conversation service.
    pub base_url: String,
    /// Workspace the mirror belongs to.
    pub workspace_id: String,
    /// Account email; doubles as the mirror's top-level folder name.
    pub email: String,
    /// Session token. Falls back to the `CONVOMIRROR_SESSION_TOKEN`
    /// environment variable when absent.
    #[serde(default)]
    pub session_token: Option<String>,
    /// Mirror root directory. Defaults to the platform data dir.
    #[serde(default)]
    pub mirror_root: Option<PathBuf>,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_workspace_label")]
    pub workspace_label: String,
    #[serde(default = "default_personal_label")]
    pub personal_label: String,
}

fn default_interval_secs() -> u64 {
    300
}
fn default_page_size() -> usize {
    25
}
fn default_concurrency() -> usize {
    3
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_workspace_label() -> String {
    "workspace".to_string()
}
fn default_personal_label() -> String {
    "chats".to_string()
}

impl FileConfig {
    /// Load from an explicit path, or from the platform config dir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing config file")
    }

    pub fn session_token(&self) -> Result<String> {
        if let Some(token) = self.session_token.as_deref() {
            return Ok(token.to_string());
        }
        std::env::var("CONVOMIRROR_SESSION_TOKEN")
            .map_err(|_| anyhow!("no session_token in config and CONVOMIRROR_SESSION_TOKEN unset"))
    }

    pub fn mirror_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.mirror_root {
            return Ok(root.clone());
        }
        let dirs = directories::ProjectDirs::from("dev", "convomirror", "convomirror")
            .ok_or_else(|| anyhow!("cannot determine a platform data directory"))?;
        Ok(dirs.data_dir().join("mirror"))
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("dev", "convomirror", "convomirror")
        .ok_or_else(|| anyhow!("cannot determine a platform config directory"))?;
    Ok(dirs.config_dir().join("config.toml"))
}

impl From<&FileConfig> for SyncConfig {
    fn from(config: &FileConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            page_size: config.page_size,
            concurrency: config.concurrency,
            retry_attempts: config.retry_attempts,
            retry_base_backoff: Duration::from_millis(config.retry_backoff_ms),
            workspace_label: config.workspace_label.clone(),
            personal_label: config.personal_label.clone(),
            ..SyncConfig::default()
        }
    }
}
