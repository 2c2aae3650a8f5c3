//! Integration tests for configuration loading and resolution
//!
//! Uses serial_test to prevent races on the IRP_CONFIG environment variable.
//! Tests that touch it are marked #[serial].

use irp_common::config::{
    load_config, load_toml_config, resolve_config_path, write_toml_config, TomlConfig,
    CONFIG_ENV_VAR,
};
use serial_test::serial;
use std::env;
use tempfile::TempDir;

#[test]
#[serial]
fn test_cli_path_wins_over_env() {
    env::set_var(CONFIG_ENV_VAR, "/from/env.toml");
    let cli = std::path::Path::new("/from/cli.toml");

    assert_eq!(resolve_config_path(Some(cli)).as_deref(), Some(cli));
    assert_eq!(
        resolve_config_path(None).as_deref(),
        Some(std::path::Path::new("/from/env.toml"))
    );

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_blank_env_is_ignored() {
    env::set_var(CONFIG_ENV_VAR, "   ");
    let resolved = resolve_config_path(None);
    env::remove_var(CONFIG_ENV_VAR);

    // Falls through to the user config dir, which only counts if it exists
    if let Some(path) = resolved {
        assert!(path.exists());
        assert!(path.ends_with("irp/config.toml"));
    }
}

#[test]
fn test_write_then_load_preserves_settings() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("config.toml");

    let mut config = TomlConfig::default();
    config.base_url = "https://ir.example.com".to_string();
    config.upload.max_concurrent_uploads = 5;
    config.upload.simulate = true;
    config.realtime.url = Some("https://abc.supabase.co".to_string());
    config.polling.max_attempts = Some(90);

    write_toml_config(&config, &path).unwrap();
    let loaded = load_toml_config(&path).unwrap();

    assert_eq!(loaded.base_url, "https://ir.example.com");
    assert_eq!(loaded.upload.max_concurrent_uploads, 5);
    assert!(loaded.upload.simulate);
    assert_eq!(loaded.realtime.url.as_deref(), Some("https://abc.supabase.co"));
    assert_eq!(loaded.polling.max_attempts, Some(90));
    assert_eq!(loaded.endpoints.upload_token, "/api/blob/upload-token");
}

#[test]
fn test_explicit_missing_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("absent.toml");
    assert!(load_config(Some(&missing)).is_err());
}

#[test]
fn test_malformed_file_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    std::fs::write(&path, "[upload\nmax_concurrent_uploads = ").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(err.to_string().contains("Parse TOML"));
}

#[test]
fn test_endpoint_overrides_keep_other_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
base_url = "http://localhost:9000"

[endpoints]
analysis_start = "/api/v2/analyze"

[logging]
level = "debug"
"#,
    )
    .unwrap();

    let config = load_toml_config(&path).unwrap();
    assert_eq!(config.endpoints.analysis_start, "/api/v2/analyze");
    assert_eq!(config.endpoints.followup, "/api/conversation/followup");
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.file.is_none());
}
