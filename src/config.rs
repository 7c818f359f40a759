// Client configuration
// Values come from the environment first, then from config.json in the user's config directory

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_BACKEND_URL: &str = "ROSHLINGUA_BACKEND_URL";
pub const ENV_ANON_KEY: &str = "ROSHLINGUA_ANON_KEY";
pub const ENV_DATA_DIR: &str = "ROSHLINGUA_DATA_DIR";

const APP_DIR_NAME: &str = "roshlingua";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the hosted backend, without trailing slash
    pub backend_url: String,
    /// Public anonymous key sent as `apikey` and to edge functions
    pub anon_key: String,
    /// Where the queue and session files live
    pub data_dir: PathBuf,
    pub primary_timeout: Duration,
    pub function_timeout: Duration,
    pub reconnect_debounce: Duration,
    pub presence_stale_after: Duration,
    pub presence_poll_interval: Duration,
    pub max_retries: u32,
}

impl ClientConfig {
    pub fn new(backend_url: &str, anon_key: &str, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            data_dir: data_dir.into(),
            primary_timeout: Duration::from_secs(10),
            function_timeout: Duration::from_secs(30),
            reconnect_debounce: Duration::from_secs(3),
            presence_stale_after: Duration::from_secs(5 * 60),
            presence_poll_interval: Duration::from_secs(15),
            max_retries: 3,
        }
    }

    pub fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.backend_url, table)
    }

    pub fn function_url(&self, name: &str) -> String {
        format!("{}/functions/v1/{}", self.backend_url, name)
    }

    /// Resolve the configuration from environment and config file.
    ///
    /// `data_dir_override` (the `--data-dir` flag) wins over both.
    pub fn load(data_dir_override: Option<PathBuf>) -> Result<Self> {
        let file = match default_config_path() {
            Some(path) if path.exists() => Some(FileConfig::read(&path)?),
            _ => None,
        };
        Self::resolve(file, data_dir_override)
    }

    fn resolve(file: Option<FileConfig>, data_dir_override: Option<PathBuf>) -> Result<Self> {
        let file = file.unwrap_or_default();

        let backend_url = env::var(ENV_BACKEND_URL)
            .ok()
            .or(file.backend_url)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("Backend URL not configured (set {})", ENV_BACKEND_URL))?;

        let anon_key = env::var(ENV_ANON_KEY)
            .ok()
            .or(file.anon_key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("Anon key not configured (set {})", ENV_ANON_KEY))?;

        let data_dir = match data_dir_override
            .or_else(|| env::var(ENV_DATA_DIR).ok().map(PathBuf::from))
            .or(file.data_dir)
        {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        let mut config = Self::new(&backend_url, &anon_key, data_dir);
        if let Some(secs) = file.primary_timeout_secs {
            config.primary_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.function_timeout_secs {
            config.function_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.presence_poll_interval_secs {
            config.presence_poll_interval = Duration::from_secs(secs);
        }

        info!("Using backend {} with data dir {}", config.backend_url, config.data_dir.display());
        Ok(config)
    }
}

/// Optional on-disk overrides.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub backend_url: Option<String>,
    pub anon_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub primary_timeout_secs: Option<u64>,
    pub function_timeout_secs: Option<u64>,
    pub presence_poll_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Invalid config file {}: {}", path.display(), e))?;
        Ok(config)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("config.json"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .ok_or_else(|| anyhow!("Could not determine data directory"))?
        .join(APP_DIR_NAME);
    Ok(dir)
}
