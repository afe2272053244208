#![cfg(unix)]
#![allow(deprecated)] // TODO: move from cargo_bin to cargo_bin_cmd!

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;

const FAKE_INCUS: &str = r#"#!/bin/sh
echo "$*" >> "$FAKE_LOG"
case "$*" in
  "profile show web") echo "Error: Profile not found" >&2; exit 1 ;;
  "profile create web") exit 0 ;;
  "profile edit web") cat > /dev/null; exit 0 ;;
  "profile show base") printf 'name: base\ndescription: ""\nconfig:\n  limits.cpu: "2"\ndevices: {}\nused_by: []\n' ;;
  "query /1.0/instances/c1") echo '{"name": "c1", "status": "Running"}' ;;
  *) echo "Error: unexpected call: $*" >&2; exit 1 ;;
esac
"#;

struct Sandbox {
    root: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let script = root.path().join("incus");
        fs::write(&script, FAKE_INCUS).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        Self { root }
    }

    fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    fn write_request(&self, content: &str) -> PathBuf {
        let path = self.root.path().join("request.yml");
        fs::write(&path, content).unwrap();
        path
    }

    fn log(&self) -> String {
        fs::read_to_string(self.root.path().join("calls.log")).unwrap_or_default()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("incusflow").unwrap();
        cmd.current_dir(self.path())
            .env("INCUS_BIN", self.path().join("incus"))
            .env("FAKE_LOG", self.path().join("calls.log"))
            .env("HOME", self.path())
            .env("XDG_CONFIG_HOME", self.path())
            .env("NO_COLOR", "1")
            .env_remove("INCUSFLOW_CONFIG")
            .env_remove("RUST_LOG");
        cmd
    }
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("incusflow").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("apply"))
        .stdout(predicate::str::contains("query"))
        .stdout(predicate::str::contains("version"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("incusflow").unwrap();
    cmd.arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("incusflow"));
}

#[test]
fn test_apply_creates_profile() {
    let sandbox = Sandbox::new();
    let request = sandbox.write_request("kind: profile\nname: web\nconfig:\n  limits.cpu: 2\n");

    sandbox
        .command()
        .arg("apply")
        .arg(&request)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""changed":true"#))
        .stdout(predicate::str::contains("Profile web created"));

    let log = sandbox.log();
    assert!(log.contains("profile create web"));
    assert!(log.contains("profile edit web"));
}

#[test]
fn test_apply_check_mode_does_not_mutate() {
    let sandbox = Sandbox::new();
    let request = sandbox.write_request("kind: profile\nname: web\n");

    sandbox
        .command()
        .args(["apply", "--check"])
        .arg(&request)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""check_mode":true"#))
        .stdout(predicate::str::contains("(check mode)"));

    assert!(!sandbox.log().contains("create"));
}

#[test]
fn test_apply_up_to_date() {
    let sandbox = Sandbox::new();
    let request =
        sandbox.write_request("kind: profile\nname: base\nconfig:\n  limits.cpu: 2\n");

    sandbox
        .command()
        .arg("apply")
        .arg(&request)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""changed":false"#))
        .stderr(predicate::str::contains("0 changed, 1 unchanged"));
}

#[test]
fn test_apply_unknown_kind_fails() {
    let sandbox = Sandbox::new();
    let request = sandbox.write_request("kind: teapot\nname: x\n");

    sandbox
        .command()
        .arg("apply")
        .arg(&request)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains(r#""failed":true"#))
        .stdout(predicate::str::contains(r#""error":"configuration""#));
}

#[test]
fn test_apply_reports_failed_command() {
    let sandbox = Sandbox::new();
    let request = sandbox.write_request("kind: network\nname: br9\n");

    sandbox
        .command()
        .arg("apply")
        .arg(&request)
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""rc":1"#))
        .stdout(predicate::str::contains("unexpected call: network create br9"));
}

#[test]
fn test_missing_client_binary() {
    let sandbox = Sandbox::new();
    let request = sandbox.write_request("kind: profile\nname: web\n");

    sandbox
        .command()
        .env("INCUS_BIN", sandbox.path().join("no-such-incus"))
        .arg("apply")
        .arg(&request)
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""error":"configuration""#));
}

#[test]
fn test_query_config() {
    let sandbox = Sandbox::new();

    sandbox
        .command()
        .args(["query", "config", "c1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "Running""#));
}

#[test]
fn test_settings_file_sets_binary() {
    let sandbox = Sandbox::new();
    fs::write(
        sandbox.path().join("incusflow.yml"),
        format!("binary: {}\n", sandbox.path().join("incus").display()),
    )
    .unwrap();

    sandbox
        .command()
        .env_remove("INCUS_BIN")
        .args(["query", "config", "c1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("c1"));
}
