//! Startup configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Five variables are required and validated together so a misconfigured
//! deployment reports every missing name at once. The remaining knobs have
//! defaults. Parsing goes through a lookup closure so tests never touch the
//! process environment.

use std::path::PathBuf;
use std::time::Duration;

use flags::ApplicationContext;

pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DATA_DIR: &str = ".flagdemo";

/// Variables that must be present and non-empty at startup.
pub const REQUIRED_VARS: [&str; 5] =
    ["NODE_ENV", "LD_CLIENT_ID", "APP_NAME", "LD_SDK_LOG_FLAG_KEY", "LD_CONSOLE_LOG_FLAG_KEY"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingVars(Vec<&'static str>),
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Deployment environment name (`development`, `production`, ...).
    pub environment: String,
    /// Client-side ID identifying the flag environment.
    pub client_id: String,
    pub app_name: String,
    /// Key of the string flag holding the flag client's own log level.
    pub sdk_log_flag_key: String,
    /// Key of the numeric flag holding the app logger's level.
    pub console_log_flag_key: String,
    /// Evaluation service base URL. `None` runs against the in-process service.
    pub base_url: Option<String>,
    pub init_timeout: Duration,
    pub request_timeout: Duration,
    /// Directory holding the local key-value store.
    pub data_dir: PathBuf,
}

impl AppConfig {
    /// Build typed config from the process environment.
    ///
    /// Required: `NODE_ENV`, `LD_CLIENT_ID`, `APP_NAME`,
    /// `LD_SDK_LOG_FLAG_KEY`, `LD_CONSOLE_LOG_FLAG_KEY`.
    ///
    /// Optional:
    /// - `LD_BASE_URL`: evaluation service; absent = offline mode
    /// - `LD_INIT_TIMEOUT_MS`: default 3000
    /// - `LD_REQUEST_TIMEOUT_SECS`: default 10
    /// - `FLAGDEMO_DATA_DIR`: default `.flagdemo`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingVars`] listing every absent required
    /// variable, or [`ConfigError::Invalid`] for an unparseable optional one.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build typed config from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`AppConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing: Vec<&'static str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|key| get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingVars(missing));
        }

        let required = |key: &'static str| get(key).unwrap_or_default();

        Ok(Self {
            environment: required("NODE_ENV"),
            client_id: required("LD_CLIENT_ID"),
            app_name: required("APP_NAME"),
            sdk_log_flag_key: required("LD_SDK_LOG_FLAG_KEY"),
            console_log_flag_key: required("LD_CONSOLE_LOG_FLAG_KEY"),
            base_url: get("LD_BASE_URL").map(|url| url.trim_end_matches('/').to_string()),
            init_timeout: Duration::from_millis(parse_u64(
                get("LD_INIT_TIMEOUT_MS"),
                "LD_INIT_TIMEOUT_MS",
                DEFAULT_INIT_TIMEOUT_MS,
            )?),
            request_timeout: Duration::from_secs(parse_u64(
                get("LD_REQUEST_TIMEOUT_SECS"),
                "LD_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            data_dir: get("FLAGDEMO_DATA_DIR").map_or_else(|| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from),
        })
    }

    /// Application half of the evaluation context.
    #[must_use]
    pub fn application_context(&self) -> ApplicationContext {
        ApplicationContext { key: self.app_name.clone(), environment: self.environment.clone() }
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

fn parse_u64(raw: Option<String>, var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::Invalid { var, reason: format!("{v:?}: {e}") }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
