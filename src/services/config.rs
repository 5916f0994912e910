use crate::constants::{limits, maintenance};
use crate::errors::{ToolError, ToolErrorKind};
use crate::utils::paths::StateLayout;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("{name} must be a non-negative integer (got {value:?})")]
    BadEnv { name: &'static str, value: String },
}

impl From<ConfigError> for ToolError {
    fn from(err: ConfigError) -> Self {
        ToolError::new(ToolErrorKind::InvalidParams, "CONFIG_INVALID", err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    pub deny_regex: Vec<String>,
    pub deny_executables: Vec<String>,
    pub require_confirm_regex: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub proxy_jump: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub retention_days: u32,
    pub idle_ttl_seconds: u64,
    pub max_connections: usize,
    pub pending_ttl_seconds: u64,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    pub local_machine: String,
    pub security: SecurityConfig,
    pub machines: BTreeMap<String, MachineConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            retention_days: maintenance::RETENTION_DAYS,
            idle_ttl_seconds: limits::IDLE_TTL_SECS,
            max_connections: limits::MAX_CONNECTIONS,
            pending_ttl_seconds: maintenance::PENDING_TTL_SECS,
            max_stdout_bytes: limits::DEFAULT_CAPTURE_BYTES,
            max_stderr_bytes: limits::DEFAULT_CAPTURE_BYTES,
            local_machine: "local".to_string(),
            security: SecurityConfig::default(),
            machines: BTreeMap::new(),
        }
    }
}

fn env_override(name: &'static str) -> Result<Option<u64>, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::BadEnv { name, value: raw })
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl FleetConfig {
    pub fn load(layout: &StateLayout) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(&layout.config_path())?;
        if let Some(value) = env_override("FLEETSSH_MAX_CONNECTIONS")? {
            config.max_connections = value as usize;
        }
        if let Some(value) = env_override("FLEETSSH_IDLE_TTL_SECONDS")? {
            config.idle_ttl_seconds = value;
        }
        if let Some(value) = env_override("FLEETSSH_RETENTION_DAYS")? {
            config.retention_days = value.min(u32::MAX as u64) as u32;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "retention_days",
            self.retention_days as u64,
            1,
            maintenance::RETENTION_DAYS_CEILING as u64,
        )?;
        check_range(
            "idle_ttl_seconds",
            self.idle_ttl_seconds,
            1,
            limits::IDLE_TTL_CEILING_SECS,
        )?;
        check_range(
            "max_connections",
            self.max_connections as u64,
            1,
            limits::MAX_CONNECTIONS_CEILING as u64,
        )?;
        check_range("max_stdout_bytes", self.max_stdout_bytes as u64, 1, u32::MAX as u64)?;
        check_range("max_stderr_bytes", self.max_stderr_bytes as u64, 1, u32::MAX as u64)?;
        Ok(())
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn pending_ttl(&self) -> Option<chrono::Duration> {
        (self.pending_ttl_seconds > 0).then(|| chrono::Duration::seconds(self.pending_ttl_seconds as i64))
    }

    pub fn pool_sweep_interval(&self) -> Duration {
        Duration::from_secs(
            self.idle_ttl_seconds
                .clamp(1, maintenance::POOL_SWEEP_CEILING_SECS),
        )
    }

    pub fn is_local(&self, machine: &str) -> bool {
        machine == self.local_machine
    }
}
