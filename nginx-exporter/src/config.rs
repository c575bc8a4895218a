use crate::metrics::{validate_buckets, DEFAULT_BUCKETS};
use crate::parser::DurationPolicy;
use crate::tailer::StartPosition;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Optional TOML file; environment variables override anything it sets.
pub const CONFIG_PATH_ENV: &str = "NGINX_EXPORTER_CONFIG";
pub const LOG_FILE_PATH_ENV: &str = "LOG_FILE_PATH";
pub const METRICS_PORT_ENV: &str = "METRICS_PORT";
pub const METRICS_BUCKETS_ENV: &str = "METRICS_BUCKETS";
pub const SKIP_HISTORICAL_ENV: &str = "SKIP_HISTORICAL";
pub const DURATION_POLICY_ENV: &str = "DURATION_POLICY";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub file_path: String,
    /// Skip content already in the file at startup and only follow new writes (DEFAULT: false)
    #[serde(default)]
    pub skip_historical: bool,
    #[serde(default)]
    pub duration_policy: DurationPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_buckets")]
    pub buckets: Vec<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    /// Only used when the platform falls back to a polling watcher.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const DEFAULT_METRICS_PORT: u16 = 9090;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_buckets() -> Vec<f64> {
    DEFAULT_BUCKETS.to_vec()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_METRICS_PORT,
            buckets: default_buckets(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Reads a TOML file without validating it; required values may still come from the
    /// environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Builds the process configuration from `NGINX_EXPORTER_CONFIG` (if set) and the
    /// environment.
    pub fn from_env() -> Result<Self> {
        Self::resolve(std::env::var(CONFIG_PATH_ENV).ok(), |key| {
            std::env::var(key).ok()
        })
    }

    pub fn resolve(
        config_path: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = match config_path.filter(|path| !path.trim().is_empty()) {
            Some(path) => Self::load(shellexpand::tilde(&path).into_owned())?,
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup(LOG_FILE_PATH_ENV).filter(|v| !v.trim().is_empty()) {
            self.log.file_path = path;
        }

        if let Some(port) = lookup(METRICS_PORT_ENV).filter(|v| !v.trim().is_empty()) {
            self.metrics.port = port.trim().parse().with_context(|| {
                format!("{METRICS_PORT_ENV} must be a port number, got {port:?}")
            })?;
        }

        if let Some(raw) = lookup(METRICS_BUCKETS_ENV).filter(|v| !v.trim().is_empty()) {
            let buckets = parse_buckets(&raw);
            if buckets.is_empty() {
                warn!(
                    env = METRICS_BUCKETS_ENV,
                    value = %raw,
                    "no usable bucket boundaries; using default buckets"
                );
                self.metrics.buckets = default_buckets();
            } else {
                self.metrics.buckets = buckets;
            }
        }

        if let Some(raw) = lookup(SKIP_HISTORICAL_ENV) {
            let trimmed = raw.trim();
            if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
                self.log.skip_historical = true;
            } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" {
                self.log.skip_historical = false;
            } else {
                warn!(
                    env = SKIP_HISTORICAL_ENV,
                    value = trimmed,
                    "unrecognized value for {}; keeping {}",
                    SKIP_HISTORICAL_ENV,
                    self.log.skip_historical
                );
            }
        }

        if let Some(raw) = lookup(DURATION_POLICY_ENV).filter(|v| !v.trim().is_empty()) {
            self.log.duration_policy = raw
                .parse()
                .with_context(|| format!("invalid {DURATION_POLICY_ENV}"))?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.log.file_path.trim().is_empty() {
            bail!("{LOG_FILE_PATH_ENV} environment variable (or log.file_path) is required");
        }
        validate_buckets(&self.metrics.buckets).context("invalid metrics buckets")?;
        Ok(())
    }

    pub fn log_file_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(self.log.file_path.trim());
        PathBuf::from(expanded.as_ref())
    }

    pub fn start_position(&self) -> StartPosition {
        if self.log.skip_historical {
            StartPosition::End
        } else {
            StartPosition::Beginning
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.poll_interval_ms)
    }
}

/// Parses a comma-separated list of bucket boundaries, ignoring entries that are not numbers.
pub fn parse_buckets(raw: &str) -> Vec<f64> {
    raw.split(',')
        .filter_map(|entry| entry.trim().parse::<f64>().ok())
        .collect()
}
