//! Integration tests for `knit install` and `knit add`.
//!
//! These only cover projects that need no registry access.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn knit(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_knit"))
        .arg("--cwd")
        .arg(cwd)
        .args(args)
        .arg("--store-dir")
        .arg(cwd.join(".store"))
        .env_remove("KNIT_NPM_REGISTRY")
        .output()
        .expect("Failed to run knit")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout)
        .unwrap_or_else(|_| panic!("stdout should be valid JSON: {stdout}"))
}

#[test]
fn test_install_without_package_json_fails_with_json_error() {
    let dir = tempdir().unwrap();
    let project = dir.path().join("empty");
    fs::create_dir_all(&project).unwrap();

    let output = knit(&project, &["--json", "install"]);
    assert!(!output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"]["code"], "PROJECT_NOT_FOUND");
    assert!(json.get("install").is_none());
}

#[test]
fn test_install_project_without_dependencies() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("package.json"),
        r#"{"name": "app", "version": "1.0.0"}"#,
    )
    .unwrap();

    let output = knit(dir.path(), &["--json", "install"]);
    let json = stdout_json(&output);
    assert!(output.status.success(), "{json}");
    assert_eq!(json["ok"], true);
    assert_eq!(json["install"]["materialized"], 0);

    assert!(dir.path().join("knit-lock.json").exists());
    let modules = dir.path().join("node_modules");
    assert!(modules.join(".knit-lock.json").exists());
    assert!(modules.join(".modules.json").exists());
}

#[test]
fn test_add_rejects_invalid_spec() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("package.json"), r#"{"name": "app"}"#).unwrap();

    let output = knit(dir.path(), &["--json", "add", " "]);
    assert!(!output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["error"]["code"], "PKG_SPEC_INVALID");

    let manifest = fs::read_to_string(dir.path().join("package.json")).unwrap();
    assert_eq!(manifest, r#"{"name": "app"}"#);
}

#[test]
fn test_add_links_local_directory() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("package.json"), r#"{"name": "app"}"#).unwrap();
    let lib = dir.path().join("lib");
    fs::create_dir_all(&lib).unwrap();
    fs::write(
        lib.join("package.json"),
        r#"{"name": "lib", "version": "0.2.0"}"#,
    )
    .unwrap();

    let output = knit(dir.path(), &["--json", "add", "lib@file:./lib"]);
    let json = stdout_json(&output);
    assert!(output.status.success(), "{json}");

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("package.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["dependencies"]["lib"], "file:./lib");
    assert!(dir
        .path()
        .join("node_modules")
        .join("lib")
        .join("package.json")
        .exists());
}

#[test]
fn test_version_prints_name() {
    let output = Command::new(env!("CARGO_BIN_EXE_knit"))
        .arg("version")
        .output()
        .expect("Failed to run knit");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("knit "));
}
