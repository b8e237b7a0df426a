use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn execguard() -> Command {
    let mut cmd = Command::cargo_bin("execguard").unwrap();
    // keep the user's config and environment out of the picture
    cmd.env_remove("RUST_LOG")
        .env_remove("EXECGUARD_POLICY_MODE")
        .env_remove("EXECGUARD_ADDR")
        .env_remove("EXECGUARD_LOG_LEVEL")
        .env_remove("EXECGUARD_LOG_FORMAT");
    cmd
}

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_cli_version() {
    execguard()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "execguard {}",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn test_cli_help() {
    execguard()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn test_cli_exec_missing_command() {
    execguard()
        .arg("exec")
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "required arguments were not provided",
        ));
}

#[test]
fn test_cli_check_config() {
    let file = config_file(
        r#"
[server]
port = 6000
max_concurrent = 3

[policy]
mode = "allowlist"
allowed_programs = ["echo", "ls"]
"#,
    );

    execguard()
        .arg("--config")
        .arg(file.path())
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 6000"))
        .stdout(predicate::str::contains("mode = \"allowlist\""))
        .stdout(predicate::str::contains("configuration OK"));
}

#[test]
fn test_cli_check_config_rejects_invalid() {
    let file = config_file(
        r#"
[execution]
max_timeout_secs = 100000
"#,
    );

    execguard()
        .arg("--config")
        .arg(file.path())
        .arg("check-config")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("max_timeout_secs"));
}

#[test]
fn test_cli_missing_config_file() {
    execguard()
        .args(["--config", "/nonexistent/execguard.toml", "check-config"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_cli_env_override() {
    let file = config_file("");

    execguard()
        .env("EXECGUARD_POLICY_MODE", "off")
        .arg("--config")
        .arg(file.path())
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("mode = \"off\""));
}

#[test]
fn test_cli_exec_unreachable_service() {
    let file = config_file(
        r#"
[client.retry]
max_attempts = 2
base_delay = 10
max_delay = 20
"#,
    );

    execguard()
        .arg("--config")
        .arg(file.path())
        .args(["exec", "--addr", "127.0.0.1:1", "echo hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("giving up after 2 attempts"));
}
