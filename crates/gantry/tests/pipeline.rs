//! End-to-end tests for version resolution, stage runs, tagging, and
//! releases against throwaway git repositories.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Returns a Command configured to run our binary.
#[allow(deprecated)]
fn cmd() -> Command {
    Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap()
}

fn gantry(dir: &Path) -> Command {
    let mut cmd = cmd();
    cmd.arg("-C").arg(dir).env("GANTRY_LOG_DIR", dir.join(".logs"));
    cmd
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A repository with one commit containing `config` as `.gantry.toml`.
fn repo_with_config(config: &str) -> TempDir {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    git(dir, &["init", "--quiet"]);
    git(dir, &["config", "user.name", "Gantry Test"]);
    git(dir, &["config", "user.email", "gantry@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    git(dir, &["config", "tag.gpgsign", "false"]);
    fs::write(dir.join(".gantry.toml"), config).unwrap();
    fs::write(dir.join(".gitignore"), ".gantry/\n.logs/\ndist/\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "--quiet", "-m", "initial"]);
    tmp
}

fn json_stdout(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

const SIMPLE_STAGES: &str = r#"
[[stages]]
name = "lint"
command = "true"

[[stages]]
name = "test"
command = "echo testing {version}"
depends_on = ["lint"]
"#;

// =============================================================================
// Version
// =============================================================================

#[test]
fn version_without_tags_is_dev_build() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    gantry(tmp.path())
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("0.0.1-dev.1+g"));
}

#[test]
fn version_on_tag_is_release() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    git(tmp.path(), &["tag", "-a", "v1.2.3", "-m", "Release v1.2.3"]);

    gantry(tmp.path())
        .arg("version")
        .assert()
        .success()
        .stdout("1.2.3\n");
}

#[test]
fn version_after_tag_counts_commits() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    git(tmp.path(), &["tag", "v1.2.3"]);
    git(tmp.path(), &["commit", "--allow-empty", "--quiet", "-m", "one"]);
    git(tmp.path(), &["commit", "--allow-empty", "--quiet", "-m", "two"]);

    let output = gantry(tmp.path())
        .args(["version", "--json"])
        .assert()
        .success();
    let json = json_stdout(output.get_output());
    assert_eq!(json["base_tag"], "v1.2.3");
    assert_eq!(json["distance"], 2);
    assert_eq!(json["dirty"], false);
    let version = json["version"].as_str().unwrap();
    assert!(version.starts_with("1.2.4-dev.2+g"), "{version}");
}

#[test]
fn version_marks_dirty_tree() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    git(tmp.path(), &["tag", "v1.0.0"]);
    fs::write(tmp.path().join(".gantry.toml"), format!("{SIMPLE_STAGES}\n# edited\n")).unwrap();

    gantry(tmp.path())
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("1.0.1-dev.0+g"))
        .stdout(predicate::str::contains(".dirty"));
}

#[test]
fn version_outside_repository_fails() {
    let tmp = TempDir::new().unwrap();
    gantry(tmp.path())
        .arg("version")
        .assert()
        .failure()
        .stderr(predicate::str::contains("repository unavailable"));
}

// =============================================================================
// Stage commands
// =============================================================================

#[test]
fn test_command_runs_test_stage() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    let output = gantry(tmp.path())
        .args(["test", "--json"])
        .assert()
        .success();
    let json = json_stdout(output.get_output());
    assert_eq!(json["state"], "completed");
    assert_eq!(json["verdict"], "success");
    let stages = json["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0]["name"], "test");

    let log = stages[0]["log_ref"].as_str().unwrap();
    let contents = fs::read_to_string(log).unwrap();
    assert!(contents.starts_with("testing 0.0.1-dev.1+g"), "{contents}");
}

#[test]
fn with_deps_includes_prerequisites() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    let output = gantry(tmp.path())
        .args(["test", "--with-deps", "--json"])
        .assert()
        .success();
    let json = json_stdout(output.get_output());
    let names: Vec<&str> = json["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["lint", "test"]);
}

#[test]
fn failing_stage_fails_the_command() {
    let tmp = repo_with_config(
        r#"
[[stages]]
name = "lint"
command = "sh -c 'exit 3'"

[[stages]]
name = "test"
command = "true"
depends_on = ["lint"]
"#,
    );
    gantry(tmp.path())
        .args(["test", "--with-deps"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("skipped: prerequisite 'lint' failed"))
        .stderr(predicate::str::contains("failed: lint"));
}

#[test]
fn missing_stage_kind_is_reported() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    gantry(tmp.path())
        .arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no 'build' stages defined"));
}

#[test]
fn missing_tool_fails_preflight() {
    let tmp = repo_with_config(
        r#"
[[stages]]
name = "lint"
command = "gantry-test-no-such-linter --strict"
"#,
    );
    gantry(tmp.path())
        .arg("lint")
        .assert()
        .failure()
        .stderr(predicate::str::contains("preflight checks failed"))
        .stderr(predicate::str::contains("gantry-test-no-such-linter"));
}

#[test]
fn cyclic_stages_are_rejected() {
    let tmp = repo_with_config(
        r#"
[[stages]]
name = "lint"
command = "true"
depends_on = ["test"]

[[stages]]
name = "test"
command = "true"
depends_on = ["lint"]
"#,
    );
    gantry(tmp.path())
        .arg("test")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn no_stages_is_fatal() {
    let tmp = repo_with_config("log_level = \"info\"\n");
    gantry(tmp.path())
        .arg("lint")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no stages defined"));
}

// =============================================================================
// Clean
// =============================================================================

#[test]
fn clean_removes_configured_paths() {
    let tmp = repo_with_config("[clean]\npaths = [\"dist\", \"out\"]\n");
    fs::create_dir_all(tmp.path().join("dist/sub")).unwrap();
    fs::write(tmp.path().join("dist/sub/a.whl"), "x").unwrap();
    fs::create_dir_all(tmp.path().join(".gantry/runs/old")).unwrap();

    gantry(tmp.path())
        .arg("clean")
        .assert()
        .success()
        .stdout(predicate::str::contains("dist"));

    assert!(!tmp.path().join("dist").exists());
    assert!(!tmp.path().join(".gantry/runs").exists());
}

#[test]
fn clean_rejects_paths_outside_project() {
    let tmp = repo_with_config("[clean]\npaths = [\"../elsewhere\"]\n");
    gantry(tmp.path())
        .arg("clean")
        .assert()
        .failure()
        .stderr(predicate::str::contains("refusing to clean"));
}

// =============================================================================
// Tag
// =============================================================================

#[test]
fn tag_creates_annotated_tag_with_prefix() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    gantry(tmp.path())
        .args(["tag", "1.4.0", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("v1.4.0"));

    let subject = git(
        tmp.path(),
        &["tag", "-l", "--format=%(contents:subject)", "v1.4.0"],
    );
    assert_eq!(subject, "Release v1.4.0");
}

#[test]
fn tag_uses_configured_prefix() {
    let tmp = repo_with_config("[version]\ntag_prefix = \"release-\"\n");
    gantry(tmp.path())
        .args(["tag", "v2.0.0-rc1", "--yes"])
        .assert()
        .success();
    assert_eq!(git(tmp.path(), &["tag", "-l"]), "release-2.0.0-rc1");

    git(tmp.path(), &["commit", "--allow-empty", "--quiet", "-m", "final"]);
    gantry(tmp.path())
        .args(["tag", "2.0.0", "--yes"])
        .assert()
        .success();
    gantry(tmp.path())
        .args(["version", "--detail"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("2.0.0\n"))
        .stdout(predicate::str::contains("release-2.0.0"))
        .stdout(predicate::str::contains(": yes"));
}

#[test]
fn tag_refuses_existing() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    git(tmp.path(), &["tag", "v1.0.0"]);
    gantry(tmp.path())
        .args(["tag", "1.0.0", "--yes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn tag_rejects_malformed_version() {
    let tmp = repo_with_config(SIMPLE_STAGES);
    gantry(tmp.path())
        .args(["tag", "1.0", "--yes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid version tag"));
    assert_eq!(git(tmp.path(), &["tag", "-l"]), "");
}

// =============================================================================
// All + release
// =============================================================================

const RELEASE_STAGES: &str = r#"
[[stages]]
name = "lint"
command = "true"

[[stages]]
name = "test"
command = "true"
depends_on = ["lint"]

[[stages]]
name = "build-linux"
command = "mkdir -p dist && echo linux > dist/app-{version}-{platform}.tar.gz"
depends_on = ["test"]
group = "build"
platform = "linux"
artifacts = ["dist/app-{version}-{platform}.tar.gz"]

[[stages]]
name = "build-any"
command = "mkdir -p dist && echo any > dist/app-{version}.whl"
depends_on = ["test"]
group = "build"
platform = "any"
artifacts = ["dist/*.whl"]
"#;

#[test]
fn all_runs_everything_without_releasing() {
    let tmp = repo_with_config(RELEASE_STAGES);
    let output = gantry(tmp.path())
        .args(["all", "--json"])
        .assert()
        .success();
    let json = json_stdout(output.get_output());
    assert_eq!(json["run"]["verdict"], "success");
    assert_eq!(json["run"]["stages"].as_array().unwrap().len(), 4);
    assert!(json.get("release").is_none());
}

#[test]
fn all_can_leave_out_groups() {
    let tmp = repo_with_config(RELEASE_STAGES);
    let output = gantry(tmp.path())
        .args(["all", "--no-build", "--no-lint", "--json"])
        .assert()
        .success();
    let json = json_stdout(output.get_output());
    let names: Vec<&str> = json["run"]["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["test"]);
}

#[test]
fn all_release_publishes_record_once() {
    let tmp = repo_with_config(RELEASE_STAGES);
    git(tmp.path(), &["tag", "-a", "v1.0.0", "-m", "Release v1.0.0"]);

    let output = gantry(tmp.path())
        .args(["all", "--release", "--json"])
        .assert()
        .success();
    let json = json_stdout(output.get_output());
    let record = &json["release"];
    assert_eq!(record["version"], "1.0.0");
    assert_eq!(record["tag"], "v1.0.0");
    let manifest = record["artifact_manifest"].as_object().unwrap();
    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest["linux"][0]["file_name"], "app-1.0.0-linux.tar.gz");
    assert_eq!(manifest["any"][0]["file_name"], "app-1.0.0.whl");

    let stored = tmp.path().join(".gantry/releases/1.0.0");
    assert!(stored.join("release.json").is_file());
    assert!(stored.join("assets/linux/app-1.0.0-linux.tar.gz").is_file());

    gantry(tmp.path())
        .args(["all", "--release"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already released"));
}

#[test]
fn all_release_requires_release_tag() {
    let tmp = repo_with_config(RELEASE_STAGES);
    gantry(tmp.path())
        .args(["all", "--release"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not releasable"));
    assert!(!tmp.path().join(".gantry/releases").exists());
}

#[test]
fn all_release_rejects_mismatched_target() {
    let tmp = repo_with_config(RELEASE_STAGES);
    git(tmp.path(), &["tag", "v1.0.0"]);
    gantry(tmp.path())
        .args(["all", "--release", "--target", "2.0.0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not match"));
}

#[test]
fn failed_pipeline_never_releases() {
    let tmp = repo_with_config(
        r#"
[[stages]]
name = "test"
command = "false"

[[stages]]
name = "build"
command = "true"
depends_on = ["test"]
platform = "any"
"#,
    );
    git(tmp.path(), &["tag", "v1.0.0"]);
    gantry(tmp.path())
        .args(["all", "--release"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("verdict: failure"));
    assert!(!tmp.path().join(".gantry/releases/1.0.0/release.json").exists());
}
