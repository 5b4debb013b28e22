//! CLI surface tests for `comfyctl version`.

use assert_cmd::Command;
use assert_fs::TempDir;
use indoc::formatdoc;
use predicates::prelude::*;

fn comfyctl(root: &TempDir) -> Command {
    let mut command = Command::cargo_bin("comfyctl").unwrap();
    command
        .arg("--cache-dir")
        .arg(root.path().join("cache"))
        .arg("--specs-dir")
        .arg(root.path().join("versions"))
        .arg("--quiet");
    command
}

fn write_pinned_spec(root: &TempDir, version_id: &str) {
    let versions = root.path().join("versions");
    fs_err::create_dir_all(&versions).unwrap();
    let spec = formatdoc! {r#"
        {{
          "schema_version": 2,
          "version_id": "{version_id}",
          "comfy": {{
            "repo": "https://github.com/comfyanonymous/ComfyUI",
            "commit": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
          }}
        }}
    "#};
    fs_err::write(versions.join(format!("{version_id}.json")), spec).unwrap();
}

#[test]
fn create_validate_and_refuse_overwrite() {
    let root = TempDir::new().unwrap();

    comfyctl(&root)
        .args(["version", "create", "wan22"])
        .assert()
        .success();
    assert!(root.path().join("versions").join("wan22.json").is_file());

    comfyctl(&root)
        .args(["version", "validate", "wan22"])
        .assert()
        .success();

    // A second create must not clobber the existing spec.
    comfyctl(&root)
        .args(["version", "create", "wan22"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn clone_rewrites_version_id() {
    let root = TempDir::new().unwrap();
    write_pinned_spec(&root, "base");

    comfyctl(&root)
        .args(["version", "clone", "base", "derived"])
        .assert()
        .success();

    let cloned =
        fs_err::read_to_string(root.path().join("versions").join("derived.json")).unwrap();
    assert!(cloned.contains("\"version_id\": \"derived\""));
}

#[test]
fn resolve_pinned_spec_is_deterministic() {
    let root = TempDir::new().unwrap();
    write_pinned_spec(&root, "t");

    comfyctl(&root)
        .args(["version", "resolve", "t"])
        .assert()
        .success();

    let lock_path = root
        .path()
        .join("cache")
        .join("resolved")
        .join("t.lock.json");
    let first = fs_err::read_to_string(&lock_path).unwrap();
    assert!(first.ends_with('\n'));
    assert!(first.contains("\"commit\": \"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\""));
    // Keys are sorted in the canonical serialization.
    assert!(first.find("\"comfy\"").unwrap() < first.find("\"version_id\"").unwrap());

    comfyctl(&root)
        .args(["version", "resolve", "t"])
        .assert()
        .success();
    let second = fs_err::read_to_string(&lock_path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn realize_dry_run_makes_no_changes() {
    let root = TempDir::new().unwrap();
    write_pinned_spec(&root, "t");

    let target = root.path().join("builds").join("comfy-t");
    comfyctl(&root)
        .args(["version", "realize", "t", "--dry-run", "--target"])
        .arg(&target)
        .assert()
        .success();
    assert!(!target.exists());
    // Dry run does not even persist the lock.
    assert!(
        !root
            .path()
            .join("cache")
            .join("resolved")
            .join("t.lock.json")
            .exists()
    );
}

#[test]
fn validate_rejects_bad_spec() {
    let root = TempDir::new().unwrap();
    let versions = root.path().join("versions");
    fs_err::create_dir_all(&versions).unwrap();
    fs_err::write(
        versions.join("broken.json"),
        r#"{"schema_version": 1, "version_id": "broken", "comfy": {"repo": "r"}}"#,
    )
    .unwrap();

    comfyctl(&root)
        .args(["version", "validate", "broken"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("schema_version"));
}

#[test]
fn missing_spec_is_a_user_error() {
    let root = TempDir::new().unwrap();
    comfyctl(&root)
        .args(["version", "resolve", "ghost"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn delete_is_idempotent() {
    let root = TempDir::new().unwrap();
    let target = root.path().join("builds").join("comfy-t");
    fs_err::create_dir_all(&target).unwrap();

    comfyctl(&root)
        .args(["version", "delete", "t", "--target"])
        .arg(&target)
        .assert()
        .success();
    assert!(!target.exists());

    comfyctl(&root)
        .args(["version", "delete", "t", "--target"])
        .arg(&target)
        .assert()
        .success();
}
