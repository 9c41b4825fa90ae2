use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::Strategy;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub quillcast: QuillcastConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub provider: Vec<ProviderConfig>,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub platform: Vec<PlatformConfig>,
    #[serde(default)]
    pub feed: Vec<FeedConfig>,
}

#[derive(Debug, Deserialize)]
pub struct QuillcastConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "quillcast.db".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// When set, every API request must present this token.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_token: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8420".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Fixed PRNG seed for the random strategy (reproducible runs).
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            seed: None,
        }
    }
}

fn default_strategy() -> String {
    "sequential".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    2
}
fn default_backoff() -> String {
    "500ms".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub display_name: Option<String>,
    /// OpenAI-compatible API root, e.g. `https://api.deepseek.com/v1`.
    pub base_url: String,
    pub default_model: String,
    pub api_key: Option<String>,
    /// Environment variable to read the API key from when `api_key` is absent.
    pub api_key_env: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_provider_timeout")]
    pub timeout: String,
    #[serde(default = "default_test_timeout")]
    pub test_timeout: String,
}

fn default_enabled() -> bool {
    true
}
fn default_provider_timeout() -> String {
    "120s".to_string()
}
fn default_test_timeout() -> String {
    "15s".to_string()
}

impl ProviderConfig {
    /// The API key from config or the named environment variable, if non-empty.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| self.api_key_env.as_ref().and_then(|var| std::env::var(var).ok()))
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishConfig {
    /// Platform whose dedicated draft endpoint serves single-target publishes.
    pub primary: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub id: String,
    pub display_name: Option<String>,
    /// Endpoints called strictly in order for a publish (e.g. cover upload, then draft creation).
    #[serde(default)]
    pub steps: Vec<String>,
    pub draft_endpoint: Option<String>,
    pub token: Option<String>,
    #[serde(default = "default_platform_timeout")]
    pub timeout: String,
}

fn default_platform_timeout() -> String {
    "60s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_feed_limit")]
    pub limit: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_feed_limit() -> u32 {
    50
}
fn default_poll_interval() -> String {
    "30m".to_string()
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.quillcast.data_dir.join(db_path)
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
    Ok(config)
}

/// Parse a humantime duration, naming the offending setting on failure.
pub fn parse_duration(setting: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ConfigError::Validation(format!("{setting} '{value}': {e}")).into())
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.quillcast.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.quillcast.version
        ))
        .into());
    }

    config
        .rotation
        .strategy
        .parse::<Strategy>()
        .map_err(|e| ConfigError::Validation(format!("rotation: {e}")))?;

    if config.retry.max_attempts == 0 {
        return Err(ConfigError::Validation("retry.max_attempts must be at least 1".to_string()).into());
    }
    parse_duration("retry.backoff", &config.retry.backoff)?;

    let mut provider_names = HashSet::new();
    for provider in &config.provider {
        if provider.name.trim().is_empty() {
            return Err(ConfigError::Validation("provider with empty name".to_string()).into());
        }
        if !provider_names.insert(&provider.name) {
            return Err(ConfigError::Validation(format!("duplicate provider name: '{}'", provider.name)).into());
        }
        validate_url(&format!("provider '{}'", provider.name), &provider.base_url)?;
        if provider.default_model.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "provider '{}': default_model must not be empty",
                provider.name
            ))
            .into());
        }
        parse_duration(&format!("provider '{}' timeout", provider.name), &provider.timeout)?;
        parse_duration(&format!("provider '{}' test_timeout", provider.name), &provider.test_timeout)?;
    }

    let mut platform_ids = HashSet::new();
    for platform in &config.platform {
        if !platform_ids.insert(platform.id.as_str()) {
            return Err(ConfigError::Validation(format!("duplicate platform id: '{}'", platform.id)).into());
        }
        if platform.steps.is_empty() && platform.draft_endpoint.is_none() {
            return Err(ConfigError::Validation(format!(
                "platform '{}': needs at least one step or a draft_endpoint",
                platform.id
            ))
            .into());
        }
        for step in platform.steps.iter().chain(platform.draft_endpoint.iter()) {
            validate_url(&format!("platform '{}'", platform.id), step)?;
        }
        parse_duration(&format!("platform '{}' timeout", platform.id), &platform.timeout)?;
    }

    if let Some(primary) = &config.publish.primary {
        let platform = config.platform.iter().find(|p| &p.id == primary).ok_or_else(|| {
            ConfigError::Validation(format!("publish.primary references unknown platform '{primary}'"))
        })?;
        if platform.draft_endpoint.is_none() {
            return Err(ConfigError::Validation(format!(
                "primary platform '{primary}' must define a draft_endpoint"
            ))
            .into());
        }
    }

    let mut feed_names = HashSet::new();
    for feed in &config.feed {
        if !feed_names.insert(&feed.name) {
            return Err(ConfigError::Validation(format!("duplicate feed name: '{}'", feed.name)).into());
        }
        validate_url(&format!("feed '{}'", feed.name), &feed.url)?;
        if feed.limit == 0 {
            return Err(ConfigError::Validation(format!("feed '{}': limit must be positive", feed.name)).into());
        }
        parse_duration(&format!("feed '{}' poll_interval", feed.name), &feed.poll_interval)?;
    }

    Ok(())
}

fn validate_url(owner: &str, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{owner}: '{url}' is not an http(s) URL")).into())
    }
}
