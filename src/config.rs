use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::credentials::CHAT_PROVIDERS;
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub plume: PlumeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Server-wide fallback credentials keyed by provider name. Per-user
    /// secrets stored in the database take precedence over these.
    #[serde(default)]
    pub providers: HashMap<String, ProviderCredentialConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlumeConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How often the scheduled-publish sweep runs, humantime format.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
    pub sweep_secret: Option<String>,
    pub sentry_dsn: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_sweep_interval() -> String {
    "60s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
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
    "plume.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Timeout for a single outbound provider call, humantime format.
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_timeout() -> String {
    "2m".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCredentialConfig {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.plume.data_dir.join(db_path)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        humantime::parse_duration(&self.generation.timeout).unwrap_or(Duration::from_secs(120))
    }

    pub fn sweep_interval(&self) -> Duration {
        humantime::parse_duration(&self.plume.sweep_interval).unwrap_or(Duration::from_secs(60))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Validate listen address
    config.plume.listen.parse::<SocketAddr>().map_err(|_| {
        ConfigError::Validation(format!("invalid listen address '{}'", config.plume.listen))
    })?;

    // Validate durations
    humantime::parse_duration(&config.plume.sweep_interval).map_err(|e| {
        ConfigError::Validation(format!(
            "sweep_interval '{}': {}",
            config.plume.sweep_interval, e
        ))
    })?;
    humantime::parse_duration(&config.generation.timeout).map_err(|e| {
        ConfigError::Validation(format!(
            "generation timeout '{}': {}",
            config.generation.timeout, e
        ))
    })?;

    // Validate generation bounds
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        return Err(ConfigError::Validation(format!(
            "temperature {} out of range (0.0 to 2.0)",
            config.generation.temperature
        ))
        .into());
    }
    if config.generation.max_tokens == 0 {
        return Err(ConfigError::Validation("max_tokens must be positive".to_string()).into());
    }

    // Validate provider sections name something this binary can talk to
    for provider in config.providers.keys() {
        let known = CHAT_PROVIDERS.contains(&provider.as_str())
            || provider == "perplexity"
            || provider == "unsplash";
        if !known {
            return Err(ConfigError::Validation(format!("unknown provider '{provider}'")).into());
        }
    }

    Ok(())
}
