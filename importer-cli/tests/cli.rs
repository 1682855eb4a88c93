//! Integration tests for the `importer` binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use importer_test_utils::images::{gzip, patterned};
use importer_test_utils::origin::{Origin, OriginConfig};
use predicates::prelude::*;
use rstest::rstest;
use tempfile::TempDir;

struct TestContext {
    dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = TempDir::new().expect("Should create temp dir");
        std::fs::create_dir_all(dir.path().join("data")).expect("Should create data dir");
        std::fs::create_dir_all(dir.path().join("scratch")).expect("Should create scratch dir");
        Self { dir }
    }

    fn data_file(&self) -> PathBuf {
        self.dir.path().join("data").join("disk.img")
    }

    fn termination_log(&self) -> PathBuf {
        self.dir.path().join("termination-log")
    }

    /// The binary with every path pointed inside the temp dir and the
    /// importer environment cleared.
    fn importer(&self) -> Command {
        let mut cmd = Command::cargo_bin("importer").expect("Should find importer binary");
        for (key, _) in std::env::vars() {
            if key.starts_with("IMPORTER_") {
                cmd.env_remove(key);
            }
        }
        cmd.env("RUST_LOG", "info")
            .arg("--data-dir")
            .arg(self.dir.path().join("data"))
            .arg("--scratch-dir")
            .arg(self.dir.path().join("scratch"))
            .arg("--proxy-cert-dir")
            .arg(self.dir.path().join("proxycerts"))
            .arg("--extra-headers-dir")
            .arg(self.dir.path().join("extraheaders"))
            .arg("--termination-message-path")
            .arg(self.termination_log());
        cmd
    }

    fn termination_message(&self) -> serde_json::Value {
        read_json(&self.termination_log())
    }
}

fn read_json(path: &Path) -> serde_json::Value {
    let text = std::fs::read_to_string(path).expect("Should read termination log");
    serde_json::from_str(&text).expect("Should parse termination log")
}

// ============================================================================
// ARGUMENTS
// ============================================================================

#[test]
fn test_help_lists_flags() {
    Command::cargo_bin("importer")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--source"))
        .stdout(predicate::str::contains("--endpoint"))
        .stdout(predicate::str::contains("--termination-message-path"))
        .stdout(predicate::str::contains("--backing-file"));
}

#[rstest]
#[case::source(&["--source", "ftp"])]
#[case::content_type(&["--content-type", "iso"])]
#[case::volume_mode(&["--volume-mode", "tape"])]
fn test_invalid_values_are_usage_errors(#[case] args: &[&str]) {
    let ctx = TestContext::new();
    ctx.importer()
        .args(args)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid value"));
    assert!(!ctx.termination_log().exists());
}

// ============================================================================
// IMPORTS
// ============================================================================

#[test]
fn test_http_import_succeeds() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).expect("Should start origin");
    let image = patterned(64 * 1024);
    origin.add("/disk.img.gz", gzip(&image));

    ctx.importer()
        .args(["--source", "http", "--endpoint"])
        .arg(origin.url("/disk.img.gz"))
        .assert()
        .success();

    assert_eq!(std::fs::read(ctx.data_file()).unwrap(), image);
    let message = ctx.termination_message();
    assert_eq!(message["message"], "Import Complete");
}

#[test]
fn test_endpoint_from_environment() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();
    let image = patterned(4096);
    origin.add("/disk.img", image.clone());

    ctx.importer()
        .env("IMPORTER_SOURCE", "http")
        .env("IMPORTER_ENDPOINT", origin.url("/disk.img"))
        .assert()
        .success();

    assert_eq!(std::fs::read(ctx.data_file()).unwrap(), image);
}

#[test]
fn test_upload_from_file() {
    let ctx = TestContext::new();
    let image = patterned(10_000);
    let body = ctx.dir.path().join("body.img");
    std::fs::write(&body, &image).unwrap();

    ctx.importer()
        .args(["--source", "upload", "--endpoint"])
        .arg(&body)
        .assert()
        .success();

    assert_eq!(std::fs::read(ctx.data_file()).unwrap(), image);
    assert_eq!(ctx.termination_message()["message"], "Import Complete");
}

// ============================================================================
// FAILURES
// ============================================================================

#[test]
fn test_missing_object_fails() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();

    ctx.importer()
        .args(["--source", "http", "--endpoint"])
        .arg(origin.url("/missing.img"))
        .assert()
        .code(1);

    let message = ctx.termination_message();
    let text = message["message"].as_str().expect("Should carry a message");
    assert!(text.contains("404"), "unexpected message: {}", text);
}

#[test]
fn test_unreachable_endpoint_fails() {
    let ctx = TestContext::new();

    ctx.importer()
        .args(["--source", "http", "--endpoint", "http://127.0.0.1:1/disk.img"])
        .assert()
        .code(1);

    assert!(ctx.termination_message()["message"].is_string());
    assert!(!ctx.data_file().exists());
}

#[test]
fn test_vddk_previous_checkpoint_requires_current() {
    let ctx = TestContext::new();

    ctx.importer()
        .args([
            "--source",
            "vddk",
            "--endpoint",
            "https://vcenter.example.com",
            "--uuid",
            "42",
            "--backing-file",
            "[ds] vm/vm.vmdk",
            "--previous-checkpoint",
            "snapshot-1",
        ])
        .assert()
        .code(1);

    assert!(ctx.termination_message()["message"].is_string());
}

// ============================================================================
// SIGNALS
// ============================================================================

#[test]
fn test_sigterm_writes_termination_message() {
    use assert_cmd::cargo::CommandCargoExt;
    use std::process::Stdio;

    let ctx = TestContext::new();
    let mut child = std::process::Command::cargo_bin("importer")
        .expect("Should find importer binary")
        .env("RUST_LOG", "info")
        .args(["--source", "upload", "--endpoint", "-", "--data-dir"])
        .arg(ctx.dir.path().join("data"))
        .arg("--scratch-dir")
        .arg(ctx.dir.path().join("scratch"))
        .arg("--termination-message-path")
        .arg(ctx.termination_log())
        .stdin(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Should start importer");
    // The upload body never arrives; the importer sits in its first read.
    let stdin = child.stdin.take();
    std::thread::sleep(std::time::Duration::from_millis(500));

    let status = std::process::Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("Should run kill");
    assert!(status.success());

    let status = child.wait().expect("Should wait for importer");
    drop(stdin);
    assert_eq!(status.code(), Some(1));
    assert_eq!(ctx.termination_message()["message"], "Import interrupted by signal 15");
}
