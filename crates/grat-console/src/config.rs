use clap::Args;
use grat_dispatch::{PollPolicy, DEFAULT_REQUEST_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_LOG_DIR: &str = ".grat/logs";

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Task service base URL
    #[arg(long, global = true)]
    pub server: Option<String>,
    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub log_dir: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    #[arg(long, global = true)]
    pub settle_delay_ms: Option<u64>,
    #[arg(long, global = true)]
    pub poll_interval_ms: Option<u64>,
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,
    #[arg(long, global = true)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub polling: PollingSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub settle_delay_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub dir: Option<String>,
    pub debug: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub server_url: String,
    pub request_timeout: Duration,
    pub poll: PollPolicy,
    pub log_dir: String,
    pub debug: bool,
}

pub fn load(args: &GlobalArgs) -> Result<ConsoleConfig, ConfigError> {
    load_with(args, |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file, then environment, then flags.
pub fn load_with<E>(args: &GlobalArgs, env: E) -> Result<ConsoleConfig, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let file = match &args.config {
        Some(path) => read_file_config(path)?,
        None => {
            let path = default_config_path(&env);
            if path.exists() {
                read_file_config(&path)?
            } else {
                FileConfig::default()
            }
        }
    };
    resolve(args, file, &env)
}

fn resolve<E>(args: &GlobalArgs, file: FileConfig, env: &E) -> Result<ConsoleConfig, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let server_url = args
        .server
        .clone()
        .or_else(|| non_empty(env("GRAT_SERVER")))
        .or(file.server.url)
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
    if server_url.trim().is_empty() {
        return Err(ConfigError::Invalid("server url must not be empty".to_string()));
    }

    let request_timeout = match args
        .request_timeout_secs
        .or(file.server.request_timeout_secs)
    {
        Some(0) => {
            return Err(ConfigError::Invalid(
                "request timeout must be at least one second".to_string(),
            ))
        }
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_REQUEST_TIMEOUT,
    };

    let defaults = PollPolicy::default();
    let poll = PollPolicy {
        settle_delay: args
            .settle_delay_ms
            .or(file.polling.settle_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.settle_delay),
        interval: args
            .poll_interval_ms
            .or(file.polling.interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.interval),
        max_attempts: args
            .max_attempts
            .or(file.polling.max_attempts)
            .unwrap_or(defaults.max_attempts)
            .max(1),
    };

    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| non_empty(env("GRAT_LOG_DIR")))
        .or(file.logging.dir)
        .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());
    let debug = args.debug || env_true(env("GRAT_DEBUG")) || file.logging.debug.unwrap_or(false);

    Ok(ConsoleConfig {
        server_url,
        request_timeout,
        poll,
        log_dir,
        debug,
    })
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn default_config_path<E>(env: &E) -> PathBuf
where
    E: Fn(&str) -> Option<String>,
{
    if let Some(path) = non_empty(env("GRAT_CONFIG_PATH")) {
        return PathBuf::from(path);
    }
    let config_dir = non_empty(env("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            non_empty(env("HOME"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        });
    config_dir.join("grat/config.toml")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn env_true(value: Option<String>) -> bool {
    match value {
        Some(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}
