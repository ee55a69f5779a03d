//! Runtime settings: TOML file first, then `VIDPIPE_*` environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::RateLimitConfig;
use crate::tracker::TrackerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value '{value}' for {name}")]
    Env { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for generated artifacts
    pub runtime_dir: PathBuf,
    /// Jobs executed concurrently
    pub workers: usize,
    pub rate_limit: RateLimitConfig,
    pub idempotency_ttl_secs: u64,
    pub tracker: TrackerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("runtime"),
            workers: 2,
            rate_limit: RateLimitConfig::default(),
            idempotency_ttl_secs: 24 * 60 * 60,
            tracker: TrackerConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = toml::from_str(raw)?;
        settings.workers = settings.workers.max(1);
        Ok(settings)
    }

    /// Load `path` when given, then overlay the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlay values from `lookup`, which maps variable names to values.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("VIDPIPE_RUNTIME_DIR").filter(|v| !v.trim().is_empty()) {
            self.runtime_dir = PathBuf::from(dir);
        }
        if let Some(workers) = parse_var::<usize>(&lookup, "VIDPIPE_WORKERS")? {
            self.workers = workers.max(1);
        }
        if let Some(limit) = parse_var(&lookup, "VIDPIPE_RATE_LIMIT")? {
            self.rate_limit.limit = limit;
        }
        if let Some(window) = parse_var(&lookup, "VIDPIPE_RATE_WINDOW_SECS")? {
            self.rate_limit.window_secs = window;
        }
        if let Some(ttl) = parse_var(&lookup, "VIDPIPE_IDEMPOTENCY_TTL_SECS")? {
            self.idempotency_ttl_secs = ttl;
        }
        Ok(())
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.runtime_dir.join("outputs")
    }

    pub fn idempotency_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idempotency_ttl_secs.min(i64::MAX as u64) as i64)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { name, value: raw }),
    }
}
