//! Application configuration management.
//!
//! This module handles loading and saving the console configuration: the
//! admin API base URL, an optional bearer token, the request timeout and how
//! long a cached list counts as fresh.
//!
//! Configuration is stored at `~/.config/crudcache/config.json`. The
//! `CRUDCACHE_API_URL` and `CRUDCACHE_API_TOKEN` environment variables
//! override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::ApiClient;

/// Application name used for config directory paths
const APP_NAME: &str = "crudcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_API_URL: &str = "CRUDCACHE_API_URL";
pub const ENV_API_TOKEN: &str = "CRUDCACHE_API_TOKEN";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
const DEFAULT_STALE_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Minutes before a cached list is refetched by `ensure_fresh`
    pub stale_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_token: None,
            request_timeout_secs: crate::api::client::REQUEST_TIMEOUT_SECS,
            stale_minutes: DEFAULT_STALE_MINUTES,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply overrides from a variable lookup. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|v: &String| !v.trim().is_empty());
        if let Some(url) = present(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(token) = present(ENV_API_TOKEN) {
            self.api_token = Some(token);
        }
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Out-of-range `stale_minutes` falls back to the default.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.stale_minutes)
            .or_else(|| chrono::Duration::try_minutes(DEFAULT_STALE_MINUTES))
            .unwrap_or_else(chrono::Duration::zero)
    }

    /// Build an API client for the configured backend.
    pub fn api_client(&self) -> Result<ApiClient> {
        let client = ApiClient::with_timeout(&self.api_base_url, self.request_timeout())?;
        Ok(match &self.api_token {
            Some(token) => client.with_token(token.clone()),
            None => client,
        })
    }
}
