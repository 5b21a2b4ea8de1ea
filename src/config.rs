use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::{DEFAULT_IMAGE_BASE_URL, DEFAULT_PAGE_SIZE};
use crate::controller::DEFAULT_STALE_AFTER;
use crate::identity::{DEFAULT_MACHINE_ID_PATHS, DEFAULT_STORAGE_KEY};
use crate::trigger::{DEFAULT_DEBOUNCE, DEFAULT_PREFETCH_MARGIN};

const DEFAULT_ENV_PREFIX: &str = "MOVIEVOTE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub list: ListConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_image_base_url")]
    pub image_base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
            page_size: default_page_size(),
            image_base_url: default_image_base_url(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_user_agent() -> String {
    format!("movievote/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_image_base_url() -> String {
    DEFAULT_IMAGE_BASE_URL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    #[serde(default = "default_machine_id_paths")]
    pub machine_id_paths: Vec<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
            machine_id_paths: default_machine_id_paths(),
        }
    }
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

fn default_machine_id_paths() -> Vec<PathBuf> {
    DEFAULT_MACHINE_ID_PATHS.iter().map(PathBuf::from).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListConfig {
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
    #[serde(default = "default_prefetch_margin")]
    pub prefetch_margin: usize,
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            prefetch_margin: default_prefetch_margin(),
            stale_after: default_stale_after(),
        }
    }
}

fn default_debounce() -> Duration {
    DEFAULT_DEBOUNCE
}

fn default_prefetch_margin() -> usize {
    DEFAULT_PREFETCH_MARGIN
}

fn default_stale_after() -> Duration {
    DEFAULT_STALE_AFTER
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(crate::storage::default_path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = match options.config_file.as_ref() {
        Some(path) if path.exists() => read_config_file(path)?,
        Some(_) => Config::default(),
        None => match default_config_path() {
            Some(path) if path.exists() => read_config_file(&path)?,
            _ => Config::default(),
        },
    };

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    for (key, value) in env_overrides(prefix) {
        apply_env_value(&mut cfg, &key, value)?;
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("config: failed to read {}", path.display()))?;
    if data.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("config: failed to parse {}", path.display()))?;
    Ok(config)
}

fn env_overrides(prefix: &str) -> HashMap<String, String> {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&upper_prefix)
                .map(|stripped| (stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect()
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) -> Result<()> {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.timeout" => {
            cfg.api.timeout = humantime::parse_duration(&value)
                .with_context(|| format!("config: invalid api.timeout {value:?}"))?;
        }
        "api.page_size" => {
            cfg.api.page_size = value
                .parse()
                .with_context(|| format!("config: invalid api.page_size {value:?}"))?;
        }
        "api.image_base_url" => cfg.api.image_base_url = value,
        "identity.storage_key" => cfg.identity.storage_key = value,
        "identity.machine_id_paths" => {
            cfg.identity.machine_id_paths = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        "list.debounce" => {
            cfg.list.debounce = humantime::parse_duration(&value)
                .with_context(|| format!("config: invalid list.debounce {value:?}"))?;
        }
        "list.prefetch_margin" => {
            cfg.list.prefetch_margin = value
                .parse()
                .with_context(|| format!("config: invalid list.prefetch_margin {value:?}"))?;
        }
        "list.stale_after" => {
            cfg.list.stale_after = humantime::parse_duration(&value)
                .with_context(|| format!("config: invalid list.stale_after {value:?}"))?;
        }
        "storage.path" => {
            cfg.storage.path = Some(value).filter(|v| !v.trim().is_empty()).map(PathBuf::from);
        }
        _ => {}
    }
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("movievote").join("config.yaml"))
}
