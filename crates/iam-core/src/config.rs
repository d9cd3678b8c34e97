//! Environment Configuration Loader
//!
//! Loads environment variables from the canonical location: `/etc/iamctl/environment`
//! and builds the [`EngineConfig`] used by the reconciler, dispatcher and store.
//!
//! ## Usage
//!
//! Call `load_environment()` early in main() before reading any config:
//!
//! ```rust
//! use iam_core::config::{load_environment, EngineConfig};
//!
//! fn main() {
//!     load_environment();
//!     let config = EngineConfig::from_env();
//!     assert!(config.pool_size > 0);
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::logging::LogConfig;

/// Default path for the environment file
pub const DEFAULT_ENV_FILE: &str = "/etc/iamctl/environment";

/// Alternative paths to check (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/iamctl/environment", "/etc/iamctl.env", ".env"];

/// Load environment variables from the canonical configuration file.
///
/// This function:
/// 1. Uses `IAMCTL_ENV_FILE` if set
/// 2. Checks `/etc/iamctl/environment` (system-wide), then `.env` (development)
/// 3. Does NOT override existing environment variables
///
/// Returns the path that was loaded, or None if no file was found.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var("IAMCTL_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded_path) = try_load_env_file(path) {
            return Some(loaded_path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return None;
    }

    match fs::read_to_string(path_obj) {
        Ok(content) => {
            let mut loaded_count = 0;
            let mut skipped_count = 0;

            for line in content.lines() {
                let line = line.trim();

                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                if let Some((key, value)) = parse_env_line(line) {
                    if std::env::var(&key).is_err() {
                        std::env::set_var(&key, &value);
                        loaded_count += 1;
                        debug!("Loaded: {}", key);
                    } else {
                        skipped_count += 1;
                        debug!("Skipped (already set): {}", key);
                    }
                }
            }

            info!(
                "Loaded {} environment variables from {} ({} skipped - already set)",
                loaded_count, path, skipped_count
            );

            Some(path.to_string())
        }
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            None
        }
    }
}

/// Parse a single environment line into key-value pair.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    // KEY=VALUE, KEY="VALUE", KEY='VALUE'
    let mut parts = line.splitn(2, '=');
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();

    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Get a configuration value with a default.
pub fn get_config(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get an optional configuration value.
pub fn get_config_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get a boolean configuration value.
pub fn get_config_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

/// Get an integer configuration value.
pub fn get_config_int(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Where the state store keeps its records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBackendKind {
    Memory,
    File(PathBuf),
    /// sqlx connection URL, e.g. `sqlite:///var/lib/iamctl/state.db`
    Sqlite(String),
}

impl StateBackendKind {
    /// Parse `memory`, `file:<path>` or `sqlite:<url>`
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("memory") {
            return Ok(StateBackendKind::Memory);
        }
        if let Some(path) = value.strip_prefix("file:") {
            if path.is_empty() {
                return Err(Error::config("file state backend requires a path"));
            }
            return Ok(StateBackendKind::File(PathBuf::from(path)));
        }
        if value.starts_with("sqlite:") {
            return Ok(StateBackendKind::Sqlite(value.to_string()));
        }
        Err(Error::config(format!("Unsupported state backend: {value}")))
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of instances reconciled concurrently
    pub pool_size: usize,
    /// Deadline for a single provider call
    pub call_timeout: Duration,
    /// Validity window of an instance lock
    pub lease_duration: Duration,
    /// How long a worker waits for a contended lock
    pub lock_wait: Duration,
    /// Largest frame accepted from a provider
    pub max_frame_bytes: usize,
    pub state_backend: StateBackendKind,
    /// Ask providers for advisory plans during Planning
    pub provider_plans: bool,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let lease_duration = Duration::from_secs(300);
        Self {
            pool_size: 4,
            call_timeout: Duration::from_secs(30),
            lease_duration,
            lock_wait: lease_duration,
            max_frame_bytes: 16 * 1024 * 1024,
            state_backend: StateBackendKind::Memory,
            provider_plans: false,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| get_config_opt(key))
    }

    /// Build config from an arbitrary key lookup; unparsable values keep defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        if let Some(size) = lookup("IAMCTL_POOL_SIZE").and_then(|v| v.parse::<usize>().ok()) {
            config.pool_size = size.max(1);
        }

        if let Some(timeout) = millis("IAMCTL_CALL_TIMEOUT_MS") {
            config.call_timeout = timeout;
        }

        if let Some(lease) = millis("IAMCTL_LEASE_MS") {
            config.lease_duration = lease;
            config.lock_wait = lease;
        }

        if let Some(wait) = millis("IAMCTL_LOCK_WAIT_MS") {
            config.lock_wait = wait;
        }

        if let Some(bytes) = lookup("IAMCTL_MAX_FRAME_BYTES").and_then(|v| v.parse::<usize>().ok()) {
            config.max_frame_bytes = bytes;
        }

        if let Some(backend) = lookup("IAMCTL_STATE_BACKEND") {
            match StateBackendKind::parse(&backend) {
                Ok(kind) => config.state_backend = kind,
                Err(e) => warn!("Ignoring IAMCTL_STATE_BACKEND: {}", e),
            }
        }

        if let Some(flag) = lookup("IAMCTL_PROVIDER_PLANS") {
            config.provider_plans = parse_bool(&flag);
        }

        if let Some(level) = lookup("IAMCTL_LOG_LEVEL") {
            config.log.level = level;
        }

        if let Some(flag) = lookup("IAMCTL_LOG_JSON") {
            config.log.json = parse_bool(&flag);
        }

        config
    }
}
