//! Configuration loading and config file resolution
//!
//! Bootstrap configuration lives in a single TOML file. Every section is
//! optional; missing sections and fields fall back to built-in defaults so a
//! missing or partial file never prevents startup.
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`IRP_CONFIG`)
//! 3. User config directory (`<config_dir>/irp/config.toml`)
//! 4. Built-in defaults (no file)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "IRP_CONFIG";

/// Default backend base URL (local development server)
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Backend base URL every endpoint path is joined onto
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upload policy and queue settings
    #[serde(default)]
    pub upload: UploadSettings,

    /// Realtime channel settings
    #[serde(default)]
    pub realtime: RealtimeSettings,

    /// Analysis status polling settings
    #[serde(default)]
    pub polling: PollingSettings,

    /// Backend endpoint paths
    #[serde(default)]
    pub endpoints: EndpointPaths,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            logging: LoggingConfig::default(),
            upload: UploadSettings::default(),
            realtime: RealtimeSettings::default(),
            polling: PollingSettings::default(),
            endpoints: EndpointPaths::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Upload validation policy and queue behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Largest accepted file in bytes (default: 50 MiB)
    pub max_file_size_bytes: u64,
    /// Accepted extensions, lower-case, without the leading dot
    pub allowed_extensions: Vec<String>,
    /// Minimum trimmed company label length in characters
    pub min_label_length: usize,
    /// Chunk size for blob transfers (default: 1 MiB)
    pub chunk_size_bytes: usize,
    /// Upper bound on simultaneously active upload tasks
    pub max_concurrent_uploads: usize,
    /// Task-level retries after a transient upload failure
    pub retry_attempts: u32,
    /// Re-sends of a single chunk after a network failure
    pub chunk_retry_attempts: u32,
    /// Token request timeout in seconds (timeout is terminal)
    pub token_timeout_secs: u64,
    /// Whole-file upload timeout in seconds (timeout is transient)
    pub upload_timeout_secs: u64,
    /// Use the simulated blob transport instead of real chunk uploads
    pub simulate: bool,
    /// Storage base URL used to build blob locations
    pub storage_base_url: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 50 * 1024 * 1024,
            allowed_extensions: ["pdf", "xlsx", "xls", "docx", "doc"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_label_length: 2,
            chunk_size_bytes: 1024 * 1024,
            max_concurrent_uploads: 3,
            retry_attempts: 1,
            chunk_retry_attempts: 1,
            token_timeout_secs: 30,
            upload_timeout_secs: 300,
            simulate: false,
            storage_base_url: "https://blob.vercel-storage.com".to_string(),
        }
    }
}

impl UploadSettings {
    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// Realtime channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// Project URL (http/https); the websocket URL is derived from it
    pub url: Option<String>,
    /// Anonymous API key sent as `apikey`
    pub api_key: Option<String>,
    /// Delay before reconnecting after a transport closure
    pub reconnect_delay_secs: u64,
    /// Heartbeat interval while connected
    pub heartbeat_interval_secs: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            reconnect_delay_secs: 5,
            heartbeat_interval_secs: 30,
        }
    }
}

impl RealtimeSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Analysis status polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Delay between polls after a successful status response
    pub interval_ms: u64,
    /// Delay before the next poll after a transient polling error
    pub error_interval_ms: u64,
    /// Give up after this many polls; unbounded when absent
    pub max_attempts: Option<u32>,
    /// Per-request timeout in seconds for analysis calls
    pub request_timeout_secs: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            error_interval_ms: 3000,
            max_attempts: None,
            request_timeout_secs: 30,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn error_interval(&self) -> Duration {
        Duration::from_millis(self.error_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Backend endpoint paths, relative to `base_url`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub client_config: String,
    pub upload_token: String,
    pub upload_chunk: String,
    pub upload_complete: String,
    pub analysis_start: String,
    pub analysis_status: String,
    pub followup: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            client_config: "/api/blob/client-config".to_string(),
            upload_token: "/api/blob/upload-token".to_string(),
            upload_chunk: "/api/blob/upload-chunk".to_string(),
            upload_complete: "/api/blob/upload-complete".to_string(),
            analysis_start: "/api/analyze-ir".to_string(),
            analysis_status: "/api/analysis-status".to_string(),
            followup: "/api/conversation/followup".to_string(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve which config file to load
///
/// Returns `None` when no file is named and none exists in the user
/// config directory; the caller then runs on built-in defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    let user_config = dirs::config_dir().map(|d| d.join("irp").join("config.toml"));
    match user_config {
        Some(path) if path.exists() => Some(path),
        _ => None,
    }
}

/// Load and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML {} failed: {}", path.display(), e)))
}

/// Resolve and load configuration, degrading to defaults
///
/// An explicitly named file that cannot be read or parsed is an error.
/// Absence of any config file is not: defaults are used and a warning logged.
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)
        }
        None => {
            warn!("No config file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Write configuration back to a TOML file, creating parent directories
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.upload.max_concurrent_uploads, 3);
        assert_eq!(config.upload.chunk_size_bytes, 1024 * 1024);
        assert_eq!(config.realtime.reconnect_delay_secs, 5);
        assert_eq!(config.polling.interval_ms, 2000);
        assert!(config.polling.max_attempts.is_none());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [upload]
            max_concurrent_uploads = 5
            allowed_extensions = ["pdf"]
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.max_concurrent_uploads, 5);
        assert_eq!(config.upload.allowed_extensions, vec!["pdf".to_string()]);
        assert_eq!(config.upload.min_label_length, 2);
        assert_eq!(config.upload.upload_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "base_url = [").unwrap();

        match load_toml_config(&path) {
            Err(Error::Config(message)) => assert!(message.starts_with("Parse TOML")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_heartbeat_is_clamped() {
        let config: TomlConfig = toml::from_str(
            r#"
            [realtime]
            heartbeat_interval_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.realtime.heartbeat_interval(), Duration::from_secs(1));
    }
}
