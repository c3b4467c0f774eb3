//! Integration tests for configuration loading from disk

use std::fs;
use tempfile::TempDir;
use waypoint_engine::config::Config;

#[test]
fn test_load_full_config_file() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("sessions");
    let config_path = dir.path().join("config.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[core]
log_level = "debug"
state_dir = "{}"

[reasoner]
default_provider = "openai"
temperature = 0.1

[reasoner.openai]
model = "gpt-4o-mini"
api_key_env = "WAYPOINT_TEST_KEY"

[tool_runner]
base_url = "http://tools.internal:9000"
timeout_secs = 10

[executor]
max_retries = 5
max_parallel = 2
skipped_satisfies_dependencies = true

[conductor]
max_cycles = 4
"#,
            state_dir.display()
        ),
    )
    .unwrap();

    let config = Config::load_from_path(&config_path).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.core.state_dir, state_dir);
    assert_eq!(config.reasoner.default_provider, "openai");
    assert_eq!(config.reasoner.default_model(), "gpt-4o-mini");
    assert_eq!(config.reasoner.openai.api_key_env, "WAYPOINT_TEST_KEY");
    assert_eq!(config.tool_runner.base_url, "http://tools.internal:9000");
    assert_eq!(config.executor.max_retries, 5);
    assert_eq!(config.executor.max_parallel, 2);
    assert!(config.executor.skipped_satisfies_dependencies);
    assert_eq!(config.conductor.max_cycles, 4);
    // Untouched sections keep their defaults
    assert_eq!(config.validator.max_iterations, 5);
    assert!(config.assessor.second_pass);
}

#[test]
fn test_invalid_values_are_rejected() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.toml");

    for body in [
        "[executor]\nmax_parallel = 0\n",
        "[assessor]\nlow_score_threshold = 1.5\n",
        "[conductor]\nmax_cycles = 0\n",
        "[core]\nlog_level = \"loud\"\n",
        "this is not toml",
    ] {
        fs::write(&config_path, body).unwrap();
        let err = Config::load_from_path(&config_path).unwrap_err();
        assert!(
            matches!(err, sdk::EngineError::Config(_)),
            "expected a config error for {:?}, got {:?}",
            body,
            err
        );
    }
}

#[test]
fn test_missing_file_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let err = Config::load_from_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_saved_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.toml");
    let mut config = Config::default();
    config.core.state_dir = dir.path().join("state");
    config.executor.max_retries = 2;

    fs::write(&config_path, toml::to_string_pretty(&config).unwrap()).unwrap();
    let loaded = Config::load_from_path(&config_path).unwrap();

    assert_eq!(loaded.executor.max_retries, 2);
    assert_eq!(loaded.core.state_dir, dir.path().join("state"));
}
