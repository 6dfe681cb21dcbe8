//! Configuration
//!
//! Layers, lowest precedence first: built-in defaults, a TOML file, `ERP_*`
//! environment variables (after `.env`), then command-line flags.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use is_terminal::IsTerminal;
use log::debug;
use serde::Deserialize;

use crate::api::{Credentials, ResilienceConfig};

pub const LOCAL_CONFIG_FILE: &str = "erp-import.toml";
pub const ENV_PREFIX: &str = "ERP_";

/// One configuration layer; unset keys leave lower layers in place
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub server_url: Option<String>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub input_path: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub retry_budget: Option<u32>,
    pub cooldown_seconds: Option<u64>,
    pub escalation_threshold: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub dry_run: Option<bool>,
    pub output_dir: Option<PathBuf>,
}

impl ConfigLayer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Read `ERP_*` variables through `lookup`
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, key)).filter(|v| !v.trim().is_empty())
        };
        Ok(Self {
            server_url: get("SERVER_URL"),
            database: get("DATABASE"),
            username: get("USERNAME"),
            password: get("PASSWORD"),
            input_path: get("INPUT_PATH").map(PathBuf::from),
            batch_size: parse_env("BATCH_SIZE", get("BATCH_SIZE"))?,
            retry_budget: parse_env("RETRY_BUDGET", get("RETRY_BUDGET"))?,
            cooldown_seconds: parse_env("COOLDOWN_SECONDS", get("COOLDOWN_SECONDS"))?,
            escalation_threshold: parse_env("ESCALATION_THRESHOLD", get("ESCALATION_THRESHOLD"))?,
            timeout_seconds: parse_env("TIMEOUT_SECONDS", get("TIMEOUT_SECONDS"))?,
            dry_run: get("DRY_RUN").map(|v| parse_flag(&v)).transpose()?,
            output_dir: get("OUTPUT_DIR").map(PathBuf::from),
        })
    }
}

fn parse_env<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .with_context(|| format!("{}{} has an invalid value: '{}'", ENV_PREFIX, key, v))
        })
        .transpose()
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{}DRY_RUN must be true or false, got '{}'", ENV_PREFIX, other),
    }
}

/// Effective configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub server_url: Option<String>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub input_path: Option<PathBuf>,
    pub batch_size: usize,
    /// Attempts per remote call
    pub retry_budget: u32,
    pub cooldown_seconds: u64,
    /// Consecutive failures before a cool-down
    pub escalation_threshold: u32,
    pub timeout_seconds: u64,
    pub dry_run: bool,
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            database: None,
            username: None,
            password: None,
            input_path: None,
            batch_size: 100,
            retry_budget: 3,
            cooldown_seconds: 30,
            escalation_threshold: 5,
            timeout_seconds: 120,
            dry_run: false,
            output_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Build the configuration from every layer. `flags` carries the
    /// command-line values.
    pub fn load(explicit: Option<&Path>, flags: ConfigLayer) -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        let mut config = Self::default();
        if let Some(path) = config_file(explicit) {
            debug!("Using config file {}", path.display());
            config.apply(ConfigLayer::from_file(&path)?);
        }
        config.apply(ConfigLayer::from_env(|key| std::env::var(key).ok())?);
        config.apply(flags);
        config.check()?;
        Ok(config)
    }

    /// Overlay the keys set in `layer`
    pub fn apply(&mut self, layer: ConfigLayer) {
        let ConfigLayer {
            server_url,
            database,
            username,
            password,
            input_path,
            batch_size,
            retry_budget,
            cooldown_seconds,
            escalation_threshold,
            timeout_seconds,
            dry_run,
            output_dir,
        } = layer;

        self.server_url = server_url.or(self.server_url.take());
        self.database = database.or(self.database.take());
        self.username = username.or(self.username.take());
        self.password = password.or(self.password.take());
        self.input_path = input_path.or(self.input_path.take());
        self.batch_size = batch_size.unwrap_or(self.batch_size);
        self.retry_budget = retry_budget.unwrap_or(self.retry_budget);
        self.cooldown_seconds = cooldown_seconds.unwrap_or(self.cooldown_seconds);
        self.escalation_threshold = escalation_threshold.unwrap_or(self.escalation_threshold);
        self.timeout_seconds = timeout_seconds.unwrap_or(self.timeout_seconds);
        self.dry_run = dry_run.unwrap_or(self.dry_run);
        if let Some(dir) = output_dir {
            self.output_dir = dir;
        }
    }

    fn check(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.batch_size == 0 {
            problems.push("batch_size must be at least 1");
        }
        if self.retry_budget == 0 {
            problems.push("retry_budget must be at least 1");
        }
        if self.escalation_threshold == 0 {
            problems.push("escalation_threshold must be at least 1");
        }
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "));
        }
        Ok(())
    }

    /// Connection parameters. A missing password is prompted for when a
    /// terminal is attached.
    pub fn credentials(&self) -> Result<Credentials> {
        let mut password = self.password.clone();
        if password.is_none() && std::io::stdin().is_terminal() {
            let user = self.username.as_deref().unwrap_or("user");
            let entered = rpassword::prompt_password(format!("Password for {}: ", user))
                .context("Failed to read password")?;
            password = Some(entered).filter(|p| !p.is_empty());
        }

        let missing: Vec<&str> = [
            ("server_url", self.server_url.is_none()),
            ("database", self.database.is_none()),
            ("username", self.username.is_none()),
            ("password", password.is_none()),
        ]
        .into_iter()
        .filter(|(_, absent)| *absent)
        .map(|(key, _)| key)
        .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "Missing required configuration: {} (set them in {}, as {}* variables or as flags)",
                missing.join(", "),
                LOCAL_CONFIG_FILE,
                ENV_PREFIX
            );
        }

        Ok(Credentials {
            server_url: self.server_url.clone().unwrap_or_default(),
            database: self.database.clone().unwrap_or_default(),
            username: self.username.clone().unwrap_or_default(),
            password: password.unwrap_or_default(),
        })
    }

    pub fn to_resilience(&self) -> ResilienceConfig {
        ResilienceConfig::builder()
            .max_attempts(self.retry_budget)
            .escalation_threshold(self.escalation_threshold)
            .cooldown(Duration::from_secs(self.cooldown_seconds))
            .request_timeout(Duration::from_secs(self.timeout_seconds))
            .build()
    }
}

/// The config file to read: the explicit one, else `./erp-import.toml`,
/// else the per-user file
fn config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|d| d.join("erp-import").join("config.toml"))
        .filter(|p| p.exists())
}
