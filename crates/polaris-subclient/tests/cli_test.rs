//! Integration tests for the `polaris-device-subclient` binary: argument
//! parsing, `--validate-config`, and exit codes -- all without requiring a
//! live GraphQL endpoint.
#![allow(clippy::unwrap_used)]

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn subclient_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("polaris-device-subclient");
    cmd.env_remove("POLARIS_API_KEY")
        .env_remove("POLARIS_API_URL")
        .env_remove("POLARIS_CONFIG")
        .env_remove("POLARIS_KEY_FILE")
        .env_remove("POLARIS_OUTPUT")
        .env_remove("POLARIS_OUTPUT_DIR")
        .env("POLARIS_CONFIG", "/tmp/polaris-subclient-test-nonexistent.toml");
    cmd
}

#[test]
fn version_flag_prints_version_and_exits_zero() {
    subclient_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("polaris-device-subclient"));
}

#[test]
fn help_flag_lists_documented_flags() {
    subclient_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("--output")
            .and(predicate::str::contains("--validate-config"))
            .and(predicate::str::contains("--dry-run"))
            .and(predicate::str::contains("--polaris-api-key")),
    );
}

#[test]
fn validate_config_without_credentials_exits_with_config_invalid_code() {
    subclient_cmd()
        .arg("--validate-config")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("credentials"));
}

#[test]
fn validate_config_with_cli_key_and_valid_url_succeeds() {
    subclient_cmd()
        .args([
            "--validate-config",
            "--polaris-api-key",
            "test-key",
            "--polaris-api-url",
            "wss://example.com/graphql",
        ])
        .assert()
        .success();
}

#[test]
fn validate_config_rejects_a_malformed_api_url() {
    subclient_cmd()
        .args([
            "--validate-config",
            "--polaris-api-key",
            "test-key",
            "--polaris-api-url",
            "not a url at all",
        ])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn completions_flag_prints_a_script_without_touching_config_or_network() {
    subclient_cmd()
        .args(["--completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("polaris-device-subclient"));
}

#[test]
fn invalid_output_value_is_rejected_by_clap() {
    let output = subclient_cmd()
        .args(["--output", "carrier-pigeon", "--validate-config"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("possible values") || stderr.contains("invalid value"));
}
