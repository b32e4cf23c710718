use integrator::config::Config as IntegratorConfig;
use serde::Deserialize;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Folder holding `radar.yml`, checked when no `--config` is given
pub const CONFIG_FOLDER_ENV: &str = "REDCAP_INTEGRATION_CONFIG_FOLDER";
const CONFIG_FILE_NAME: &str = "radar.yml";
const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/radar-redcap-int/radar.yml";

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            sentry_dsn: None,
        }
    }
}

impl std::fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("level", &self.level)
            .field("sentry_dsn", &self.sentry_dsn.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
    pub integrator: IntegratorConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("no config file found, tried {}", display_paths(.0))]
    NotFound(Vec<PathBuf>),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Picks the config file: the explicit path if given, otherwise the first
/// existing file among `$REDCAP_INTEGRATION_CONFIG_FOLDER/radar.yml` and the
/// system-wide default.
pub fn discover(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    discover_in(
        explicit,
        std::env::var_os(CONFIG_FOLDER_ENV),
        Path::new(DEFAULT_CONFIG_PATH),
    )
}

fn discover_in(
    explicit: Option<PathBuf>,
    folder: Option<OsString>,
    default_path: &Path,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let candidates: Vec<PathBuf> = folder
        .map(|folder| PathBuf::from(folder).join(CONFIG_FILE_NAME))
        .into_iter()
        .chain([default_path.to_path_buf()])
        .collect();

    match candidates.iter().find(|path| path.is_file()) {
        Some(path) => Ok(path.clone()),
        None => Err(ConfigError::NotFound(candidates)),
    }
}
