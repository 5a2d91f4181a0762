// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_CORE_LOG_LEVEL: &str = "warning";
const DEFAULT_SETTINGS_PATH: &str = "./settings.json";
const DEFAULT_ACCESS_LOG: &str = "xray_access.log";
const DEFAULT_CORE_LOG: &str = "xray_core.log";
const DEFAULT_CORES_DIR: &str = "cores";
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Runtime settings of the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Level of the supervisor's own diagnostics (trace, debug, info, warn, error)
    pub log_level: String,
    /// Level handed to the core; unknown values fall back to `info` at launch
    pub core_log_level: String,
    /// Settings document fed to the core
    pub settings_path: PathBuf,
    pub access_log: PathBuf,
    pub core_log: PathBuf,
    /// Directory holding the `Xray-<os>-<arch>` releases
    pub cores_dir: PathBuf,
    pub stats_interval: Duration,
    /// How long shutdown may take before the process exits anyway
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            core_log_level: DEFAULT_CORE_LOG_LEVEL.to_string(),
            settings_path: PathBuf::from(DEFAULT_SETTINGS_PATH),
            access_log: PathBuf::from(DEFAULT_ACCESS_LOG),
            core_log: PathBuf::from(DEFAULT_CORE_LOG),
            cores_dir: PathBuf::from(DEFAULT_CORES_DIR),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|val| val.trim().parse::<u64>().ok())
            .unwrap_or(default),
    )
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var_os(key)
        .filter(|val| !val.is_empty())
        .map_or_else(|| PathBuf::from(default), PathBuf::from)
}

impl SupervisorConfig {
    /// Create configuration from `XRAYMON_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("XRAYMON_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
        let core_log_level = env::var("XRAYMON_CORE_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| DEFAULT_CORE_LOG_LEVEL.to_string());

        let config = Self {
            log_level,
            core_log_level,
            settings_path: env_path("XRAYMON_SETTINGS_PATH", DEFAULT_SETTINGS_PATH),
            access_log: env_path("XRAYMON_ACCESS_LOG", DEFAULT_ACCESS_LOG),
            core_log: env_path("XRAYMON_CORE_LOG", DEFAULT_CORE_LOG),
            cores_dir: env_path("XRAYMON_CORES_DIR", DEFAULT_CORES_DIR),
            stats_interval: env_secs("XRAYMON_STATS_INTERVAL_SECS", DEFAULT_STATS_INTERVAL_SECS),
            shutdown_timeout: env_secs(
                "XRAYMON_SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.stats_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "XRAYMON_STATS_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self
            .settings_path
            .file_name()
            .is_some_and(|name| name == "config.json")
        {
            return Err(ConfigError::Invalid(format!(
                "settings file can't be named config.json: {}",
                self.settings_path.display()
            )));
        }

        if self.access_log == self.core_log {
            return Err(ConfigError::Invalid(
                "access and core journals must be different files".to_string(),
            ));
        }

        Ok(())
    }
}
