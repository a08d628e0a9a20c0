use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Allowed resident memory for a single worker, in MB.
pub const DEFAULT_MEMORY_LIMIT_MB: f64 = 150.0;
pub const DEFAULT_LOG_FILE: &str = "passenger_monitoring.log";
/// Seconds between the graceful signal and the liveness check.
pub const DEFAULT_WAIT_TIME_SECS: u64 = 10;
/// Marks the stats lines that belong to application workers.
pub const DEFAULT_PROCESS_NAME_REGEX: &str = "Passenger RubyApp:";
pub const DEFAULT_STATS_COMMAND: &str = "passenger-memory-stats";

/// A raw configuration value as it arrives from a file or the command line.
///
/// TOML may carry `memory_limit = 200` or `memory_limit = "200"`; both are
/// converted through the same strict parser.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    fn as_f64(&self, key: &'static str) -> Result<f64, ConfigError> {
        let parsed = match self {
            ParamValue::Number(n) => Some(*n),
            ParamValue::Text(s) => s.trim().parse::<f64>().ok(),
        };
        match parsed {
            Some(n) if n.is_finite() && n >= 0.0 => Ok(n),
            _ => Err(ConfigError::InvalidNumber {
                key,
                value: self.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        ParamValue::Number(n)
    }
}

/// Unresolved monitor settings. Every key is optional; an absent key falls
/// back to its default during [`MonitorConfig::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorParams {
    pub memory_limit: Option<ParamValue>,
    pub log_file: Option<String>,
    pub wait_time: Option<ParamValue>,
    pub process_name_regex: Option<String>,
    pub stats_command: Option<String>,
}

impl MonitorParams {
    /// Layer `overrides` on top of `self`; keys present in `overrides` win.
    pub fn merge(self, overrides: MonitorParams) -> MonitorParams {
        MonitorParams {
            memory_limit: overrides.memory_limit.or(self.memory_limit),
            log_file: overrides.log_file.or(self.log_file),
            wait_time: overrides.wait_time.or(self.wait_time),
            process_name_regex: overrides.process_name_regex.or(self.process_name_regex),
            stats_command: overrides.stats_command.or(self.stats_command),
        }
    }
}

/// Top-level layout of `passenger-monitor.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    monitor: MonitorParams,
}

/// Load the `[monitor]` table from a TOML file.
///
/// A missing file yields empty params so that defaults apply. A file that
/// exists but cannot be read or parsed is an error.
pub fn load_params(path: &Path) -> Result<MonitorParams, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(MonitorParams::default());
        }
        Err(e) => {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let file: ConfigFile = toml::from_str(&contents).map_err(|e| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(file.monitor)
}

/// Fully resolved, immutable settings for one check pass.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub memory_limit_mb: f64,
    pub log_file: PathBuf,
    pub wait_time: Duration,
    pub process_name_regex: Regex,
    /// Program followed by its arguments.
    pub stats_command: Vec<String>,
}

impl MonitorConfig {
    /// Resolve params into a config, converting each supplied value strictly.
    pub fn resolve(params: &MonitorParams) -> Result<Self, ConfigError> {
        let memory_limit_mb = match &params.memory_limit {
            Some(v) => v.as_f64("memory_limit")?,
            None => DEFAULT_MEMORY_LIMIT_MB,
        };

        let log_file = PathBuf::from(params.log_file.as_deref().unwrap_or(DEFAULT_LOG_FILE));

        let wait_time = match &params.wait_time {
            Some(v) => {
                let secs = v.as_f64("wait_time")?;
                Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidNumber {
                    key: "wait_time",
                    value: v.to_string(),
                })?
            }
            None => Duration::from_secs(DEFAULT_WAIT_TIME_SECS),
        };

        let pattern = params
            .process_name_regex
            .as_deref()
            .unwrap_or(DEFAULT_PROCESS_NAME_REGEX);
        let process_name_regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source: e,
        })?;

        let stats_command: Vec<String> = params
            .stats_command
            .as_deref()
            .unwrap_or(DEFAULT_STATS_COMMAND)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if stats_command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        Ok(Self {
            memory_limit_mb,
            log_file,
            wait_time,
            process_name_regex,
            stats_command,
        })
    }
}

/// Errors raised while building a [`MonitorConfig`].
#[derive(Debug)]
pub enum ConfigError {
    /// A numeric key was not a finite, non-negative number.
    InvalidNumber { key: &'static str, value: String },
    /// The worker pattern did not compile.
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    /// `stats_command` was blank.
    EmptyCommand,
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidNumber { key, value } => {
                write!(f, "invalid value for {key}: '{value}' is not a non-negative number")
            }
            ConfigError::InvalidPattern { pattern, source } => {
                write!(f, "invalid process_name_regex '{pattern}': {source}")
            }
            ConfigError::EmptyCommand => write!(f, "stats_command must not be empty"),
            ConfigError::ReadFile { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::ParseFile { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPattern { source, .. } => Some(source),
            ConfigError::ReadFile { source, .. } => Some(source),
            ConfigError::ParseFile { source, .. } => Some(source),
            ConfigError::InvalidNumber { .. } | ConfigError::EmptyCommand => None,
        }
    }
}
