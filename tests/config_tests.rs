//! Recipe loading tests that touch the process environment.

use pyship::config::BuildConfig;
use pyship::error::BuildError;
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

const OVERRIDES: [&str; 4] = ["PYSHIP_PYTHON", "PYSHIP_PORT", "PYSHIP_USER", "PYSHIP_WORKDIR"];

fn clear_overrides() {
    for key in OVERRIDES {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn environment_overrides_recipe() {
    clear_overrides();
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("pyship.toml"),
        "name = \"bot\"\n[base]\npython = \"3.11\"\n[network]\nport = 8000\n",
    )
    .unwrap();

    std::env::set_var("PYSHIP_PYTHON", "3.12");
    std::env::set_var("PYSHIP_PORT", "9000");
    std::env::set_var("PYSHIP_WORKDIR", "/srv/bot");
    let config = BuildConfig::load(dir.path(), None);
    clear_overrides();

    let config = config.unwrap();
    assert_eq!(config.base.python, "3.12");
    assert_eq!(config.network.port, 9000);
    assert_eq!(config.workdir, "/srv/bot");
    config.validate().unwrap();
}

#[test]
#[serial]
fn bad_port_override_is_invalid_config() {
    clear_overrides();
    let dir = TempDir::new().unwrap();
    std::env::set_var("PYSHIP_PORT", "eighty");
    let err = BuildConfig::load(dir.path(), None).unwrap_err();
    clear_overrides();

    assert_eq!(BuildError::find(&err).unwrap().kind(), "InvalidConfig");
}

#[test]
#[serial]
fn missing_recipe_uses_defaults_but_needs_a_pin() {
    clear_overrides();
    let dir = TempDir::new().unwrap();
    let config = BuildConfig::load(dir.path(), None).unwrap();
    assert_eq!(config.workdir, "/app");
    assert_eq!(config.network.port, 8000);
    assert_eq!(config.launch.entrypoint, vec!["python", "main.py"]);

    let err = config.validate().unwrap_err();
    assert_eq!(BuildError::find(&err).unwrap().kind(), "InvalidConfig");
}

#[test]
#[serial]
fn explicit_recipe_must_exist() {
    clear_overrides();
    let dir = TempDir::new().unwrap();
    let err = BuildConfig::load(dir.path(), Some(std::path::Path::new("other.toml"))).unwrap_err();
    assert!(err.to_string().contains("other.toml"));
}
