//! Integration tests for configuration loading and validation.

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::rstest;
use tempfile::TempDir;

use labwright::config::{ConfigError, DEFAULT_STATE_FILE, LabConfig};
use labwright::test_support::EnvGuard;

#[tokio::test]
async fn defaults_apply_without_files_or_environment() {
    let _guard = EnvGuard::set_vars(&[]).await;

    let config = LabConfig::load_without_cli_args().expect("defaults load");

    assert_eq!(config.concurrency_limit, 4);
    assert_eq!(config.retry_max_attempts, 5);
    assert_eq!(config.state_file, DEFAULT_STATE_FILE);
    assert_eq!(config.validate(), Ok(()));
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let _guard = EnvGuard::set_vars(&[
        ("LABWRIGHT_CONCURRENCY_LIMIT", "12"),
        ("LABWRIGHT_GROUP_INSTANCES_WARN", "3"),
        ("LABWRIGHT_SERVICE_INSTANCES_WARN", "7"),
        ("LABWRIGHT_STATE_FILE", "/tmp/labwright-state.json"),
    ])
    .await;

    let config = LabConfig::load_without_cli_args().expect("env loads");

    assert_eq!(config.run_settings().concurrency_limit, 12);
    assert_eq!(config.thresholds().group_instances_warn, 3);
    assert_eq!(config.thresholds().service_instances_warn, 7);
    assert_eq!(config.thresholds().service_instances_error, 70);
    assert_eq!(config.state_file_path().as_str(), "/tmp/labwright-state.json");
}

#[tokio::test]
async fn config_file_named_by_env_var_is_read() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non UTF-8 temp path {}", path.display()));
    Dir::open_ambient_dir(&root, ambient_authority())
        .and_then(|dir| dir.write("custom.toml", "retry_max_attempts = 9\nretry_multiplier = 3\n"))
        .unwrap_or_else(|err| panic!("write config: {err}"));
    let path = root.join("custom.toml");
    let _guard = EnvGuard::set_vars(&[("LABWRIGHT_CONFIG_PATH", path.as_str())]).await;

    let config = LabConfig::load_without_cli_args().expect("file loads");

    let policy = config.retry_policy();
    assert_eq!(policy.max_attempts, 9);
    assert_eq!(policy.multiplier, 3);
}

#[rstest]
#[case::concurrency(LabConfig { concurrency_limit: 0, ..LabConfig::with_defaults() }, "concurrency_limit")]
#[case::multiplier(LabConfig { retry_multiplier: 0, ..LabConfig::with_defaults() }, "retry_multiplier")]
#[case::thresholds(LabConfig { group_instances_warn: 60, ..LabConfig::with_defaults() }, "group_instances_error")]
#[case::service_thresholds(LabConfig { service_instances_warn: 80, ..LabConfig::with_defaults() }, "service_instances_error")]
fn invalid_values_name_the_toml_key(#[case] config: LabConfig, #[case] key: &str) {
    let error = config.validate().expect_err("out of range");

    let ConfigError::Invalid(ref message) = error else {
        panic!("expected Invalid error");
    };
    assert!(message.contains(key), "error should mention TOML key: {message}");
    assert!(
        message.contains("labwright.toml"),
        "error should mention config file: {message}"
    );
}
