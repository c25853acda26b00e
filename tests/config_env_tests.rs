// ABOUTME: Environment-variable override behavior of config loading.
// ABOUTME: Serialized because the overrides read process-global state.

use serial_test::serial;
use std::path::PathBuf;
use switchboard_core::Config;

fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("switchboard.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
#[serial]
fn test_env_overrides_bind_and_port() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[gateway]\nbind = \"127.0.0.1\"\nport = 1000\n");

    std::env::set_var("SWITCHBOARD_BIND", "0.0.0.0");
    std::env::set_var("SWITCHBOARD_PORT", "4242");
    let config = Config::load(&path).unwrap();
    std::env::remove_var("SWITCHBOARD_BIND");
    std::env::remove_var("SWITCHBOARD_PORT");

    assert_eq!(config.gateway.bind, "0.0.0.0");
    assert_eq!(config.gateway.port, 4242);
}

#[test]
#[serial]
fn test_env_token_fills_missing_credential() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[gateway.auth]\nmode = \"token\"\n");

    // Without the env token the config is invalid: token mode needs a credential.
    std::env::remove_var("SWITCHBOARD_TOKEN");
    std::env::remove_var("SWITCHBOARD_PASSWORD");
    assert!(Config::load(&path).is_err());

    std::env::set_var("SWITCHBOARD_TOKEN", "sekrit");
    let config = Config::load(&path).unwrap();
    std::env::remove_var("SWITCHBOARD_TOKEN");

    assert_eq!(config.gateway.auth.token.as_deref(), Some("sekrit"));
}

#[test]
#[serial]
fn test_file_values_stand_without_env() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[gateway]\nport = 2001\n");

    std::env::remove_var("SWITCHBOARD_PORT");
    let config = Config::load(&path).unwrap();
    assert_eq!(config.gateway.port, 2001);
}
