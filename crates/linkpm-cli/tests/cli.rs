//! Integration tests for the `linkpm` binary.
//!
//! Every test uses a private store and the offline registry so nothing
//! touches the network or the user's cache.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::{tempdir, TempDir};

fn linkpm(cwd: &Path, store: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_linkpm"));
    cmd.arg("--cwd")
        .arg(cwd)
        .env("LINKPM_STORE_DIR", store)
        .env("LINKPM_NPM_REGISTRY", "http://127.0.0.1:9/")
        .env_remove("RUST_LOG");
    cmd
}

/// A project directory and a store directory under one tempdir.
fn workspace() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
    let tmp = tempdir().unwrap();
    let project = tmp.path().join("project");
    let store = tmp.path().join("store");
    fs::create_dir_all(&project).unwrap();
    (tmp, project, store)
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim())
        .unwrap_or_else(|_| panic!("stdout should be valid JSON: {stdout}"))
}

#[test]
fn test_version() {
    let (_tmp, project, store) = workspace();
    let output = linkpm(&project, &store).arg("version").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("linkpm "), "unexpected output: {stdout}");
}

#[test]
fn test_install_without_manifest_json_error() {
    let (_tmp, project, store) = workspace();
    let output = linkpm(&project, &store)
        .args(["--json", "install", "--offline"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"]["code"], "PKG_MANIFEST_MISSING");
}

#[test]
fn test_install_without_manifest_human_error() {
    let (_tmp, project, store) = workspace();
    let output = linkpm(&project, &store)
        .args(["install", "--offline"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("PKG_MANIFEST_MISSING"), "stderr: {stderr}");
}

#[test]
fn test_install_empty_project_writes_lockfiles() {
    let (_tmp, project, store) = workspace();
    fs::write(
        project.join("package.json"),
        r#"{"name": "app", "version": "1.0.0", "dependencies": {}}"#,
    )
    .unwrap();

    let output = linkpm(&project, &store)
        .args(["--json", "install", "--offline", "--ignore-scripts"])
        .output()
        .unwrap();

    let json = stdout_json(&output);
    assert_eq!(json["ok"], true, "output: {json}");
    assert_eq!(json["resolved"], 0);
    assert!(project.join("linkpm-lock.json").exists());
    assert!(project.join("node_modules/.linkpm-lock.json").exists());
    assert!(project.join("node_modules/.modules.json").exists());
    assert!(!project.join(".linkpm.lock").exists());
}

#[test]
fn test_install_times_out_on_held_lock() {
    let (_tmp, project, store) = workspace();
    fs::write(project.join("package.json"), r#"{"name": "app"}"#).unwrap();
    fs::write(project.join(".linkpm.lock"), "1").unwrap();
    fs::write(
        project.join("linkpm.json"),
        r#"{"retry": {"retries": 1, "minTimeout": 10, "maxTimeout": 10, "factor": 1.0}}"#,
    )
    .unwrap();

    let output = linkpm(&project, &store)
        .args(["--json", "install", "--offline", "--config", "linkpm.json"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["error"]["code"], "PKG_LOCK_TIMEOUT");
    assert!(project.join(".linkpm.lock").exists());
}

#[test]
fn test_uninstall_requires_packages() {
    let (_tmp, project, store) = workspace();
    let output = linkpm(&project, &store).arg("uninstall").output().unwrap();

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_uninstall_undeclared_package() {
    let (_tmp, project, store) = workspace();
    fs::write(
        project.join("package.json"),
        r#"{"name": "app", "version": "1.0.0", "dependencies": {}}"#,
    )
    .unwrap();

    let output = linkpm(&project, &store)
        .args(["--json", "uninstall", "left-pad", "--offline"])
        .output()
        .unwrap();

    let json = stdout_json(&output);
    assert_eq!(json["ok"], true, "output: {json}");
    assert_eq!(json["uninstalled"][0], "left-pad");
}

#[cfg(unix)]
#[test]
fn test_link_and_unlink_local_package() {
    let (tmp, project, store) = workspace();
    let lib = tmp.path().join("lib");
    fs::create_dir_all(&lib).unwrap();
    fs::write(
        lib.join("package.json"),
        r#"{"name": "my-lib", "version": "0.1.0"}"#,
    )
    .unwrap();

    let output = linkpm(&project, &store)
        .args(["--json", "link", "../lib"])
        .output()
        .unwrap();
    let json = stdout_json(&output);
    assert_eq!(json["ok"], true, "output: {json}");
    assert_eq!(json["name"], "my-lib");

    let link = project.join("node_modules/my-lib");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(
        fs::canonicalize(&link).unwrap(),
        fs::canonicalize(&lib).unwrap()
    );

    let output = linkpm(&project, &store)
        .args(["--json", "unlink"])
        .output()
        .unwrap();
    let json = stdout_json(&output);
    assert_eq!(json["ok"], true, "output: {json}");
    assert_eq!(json["unlinked"][0], "my-lib");
    assert!(fs::symlink_metadata(&link).is_err());
}

#[test]
fn test_link_without_manifest_fails() {
    let (tmp, project, store) = workspace();
    let lib = tmp.path().join("empty-lib");
    fs::create_dir_all(&lib).unwrap();

    let output = linkpm(&project, &store)
        .args(["--json", "link"])
        .arg(&lib)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["error"]["code"], "PKG_MANIFEST_MISSING");
}
