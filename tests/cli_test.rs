// file: tests/cli_test.rs
// version: 1.0.0
// guid: bc234567-890a-def0-1234-56789abcdef0

//! Command-line surface tests

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_every_subcommand() {
    Command::cargo_bin("pi-provision-agent")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("list-devices")
                .and(predicate::str::contains("generate-keys"))
                .and(predicate::str::contains("flash"))
                .and(predicate::str::contains("discover"))
                .and(predicate::str::contains("test-connection"))
                .and(predicate::str::contains("install")),
        );
}

#[test]
fn test_list_devices_json_is_machine_readable() {
    Command::cargo_bin("pi-provision-agent")
        .unwrap()
        .args(["list-devices", "--json"])
        .assert()
        .success()
        .stdout(predicate::function(|out: &str| {
            serde_json::from_str::<serde_json::Value>(out).is_ok()
        }));
}

#[test]
fn test_install_requires_an_auth_mode() {
    Command::cargo_bin("pi-provision-agent")
        .unwrap()
        .args([
            "install",
            "jellypi",
            "--username",
            "pi",
            "--services",
            "services.toml",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_flash_rejects_unknown_device_path() {
    Command::cargo_bin("pi-provision-agent")
        .unwrap()
        .args([
            "flash",
            "--device",
            "/dev/definitely-not-a-device",
            "--config",
            "/nonexistent/provision.toml",
        ])
        .assert()
        .failure();
}

#[test]
fn test_generate_keys_prints_an_openssh_pair() {
    Command::cargo_bin("pi-provision-agent")
        .unwrap()
        .arg("generate-keys")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("ssh-ed25519")
                .and(predicate::str::contains("BEGIN OPENSSH PRIVATE KEY")),
        );
}
