//! Binary-level checks of argument handling and output

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

fn bin() -> Command {
    let mut cmd = Command::cargo_bin("stateful-collector").unwrap();
    cmd.env_remove("GITHUB_TOKEN").env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_stages_json_lists_execution_order() {
    let output = bin()
        .args(["stages", "--output-format", "json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stages: Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = stages
        .as_array()
        .unwrap()
        .iter()
        .map(|stage| stage["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["collect_runs", "extract_runs", "collect_jobs", "extract_jobs"]);
    assert_eq!(stages[2]["skip_on_fail"], true);
    assert_eq!(stages[2]["dependency_tables"][0], "github_runs");
}

#[test]
fn test_stages_human_output() {
    let output = bin().arg("stages").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Registered stages (4)"));
    assert!(stdout.contains("collect_jobs [enabled, skip-on-fail]"));
}

#[test]
fn test_run_rejects_repo_without_owner() {
    let dir = TempDir::new().unwrap();

    bin()
        .args(["run", "--repo", "devlake", "--data-dir"])
        .arg(dir.path())
        .assert()
        .failure();
}

#[test]
fn test_run_rejects_out_of_range_workers() {
    bin()
        .args(["run", "--repo", "apache/devlake", "--workers", "0"])
        .assert()
        .failure();
}

#[test]
fn test_unreachable_upstream_skips_instead_of_failing() {
    let dir = TempDir::new().unwrap();

    // Nothing listens on the discard port; the only item exhausts its single attempt
    let output = bin()
        .args([
            "run",
            "--repo",
            "apache/devlake",
            "--endpoint",
            "http://127.0.0.1:9",
            "--max-retries",
            "0",
            "--output-format",
            "json",
            "--data-dir",
        ])
        .arg(dir.path())
        .output()
        .unwrap();

    assert!(output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["repo"], "apache/devlake");
    let stages = report["stages"].as_array().unwrap();
    assert_eq!(stages[0]["name"], "collect_runs");
    assert_eq!(stages[0]["state"], "COMPLETED");
    assert_eq!(stages[0]["report"]["partial"], true);
    assert_eq!(stages[1]["state"], "SKIPPED");
}
