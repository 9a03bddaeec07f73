//! CLI integration tests.
//!
//! These exercise argument parsing and the job-spec-driven subcommands
//! against invalid/missing input; full pipeline runs need media fixtures
//! and external tools (ffmpeg/mkvmerge) not available in this environment.

use std::process::Command;

fn audiosync_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_audiosync"))
}

fn scratch_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("audiosync_cli_test_{}_{name}", std::process::id()))
}

#[test]
fn test_version() {
    let output = audiosync_bin()
        .arg("--version")
        .output()
        .expect("failed to run audiosync");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("3.0.0"),
        "version output should contain 3.0.0, got: {stdout}"
    );
}

#[test]
fn test_help() {
    let output = audiosync_bin()
        .arg("--help")
        .output()
        .expect("failed to run audiosync");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("audiosync"));
    assert!(stdout.contains("probe"));
    assert!(stdout.contains("analyze"));
    assert!(stdout.contains("plan"));
    assert!(stdout.contains("run"));
}

#[test]
fn test_probe_help() {
    let output = audiosync_bin()
        .args(["probe", "--help"])
        .output()
        .expect("failed to run audiosync");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("verbose"));
}

#[test]
fn test_run_help() {
    let output = audiosync_bin()
        .args(["run", "--help"])
        .output()
        .expect("failed to run audiosync");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--workdir"));
    assert!(stdout.contains("--state"));
}

#[test]
fn test_probe_missing_job_spec_arg() {
    let output = audiosync_bin()
        .arg("probe")
        .output()
        .expect("failed to run audiosync");
    assert!(!output.status.success(), "should fail without a job spec path");
}

#[test]
fn test_probe_nonexistent_job_spec() {
    let output = audiosync_bin()
        .args(["probe", "/nonexistent/job.json"])
        .output()
        .expect("failed to run audiosync");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot read job spec"), "got: {stderr}");
}

#[test]
fn test_analyze_malformed_job_spec() {
    let path = scratch_path("malformed.json");
    std::fs::write(&path, "{ not valid json").unwrap();

    let output = audiosync_bin()
        .args(["analyze", path.to_str().unwrap()])
        .output()
        .expect("failed to run audiosync");
    let _ = std::fs::remove_file(&path);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("malformed job spec"), "got: {stderr}");
}

#[test]
fn test_plan_missing_job_spec_arg() {
    let output = audiosync_bin()
        .arg("plan")
        .output()
        .expect("failed to run audiosync");
    assert!(!output.status.success());
}

#[test]
fn test_run_nonexistent_job_spec() {
    let output = audiosync_bin()
        .args(["run", "/nonexistent/job.json"])
        .output()
        .expect("failed to run audiosync");
    assert!(!output.status.success());
}
