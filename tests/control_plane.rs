//! Integration tests for the operational CLI
//!
//! Runs the application as a subprocess against a scratch state store and
//! asserts its output for the `quota`, `submit`, `requests`, `process`,
//! `status`, `tidy` and `fix` commands.
//!
//! You can run them with 'nextest':
//! `cargo nextest run -E 'test(control_plane)'`.

use abscissa_core::testing::prelude::*;

use nla_testing::{get_matches, TestResult};
use std::io::Read;
use tempfile::{tempdir, TempDir};

pub fn nla_runner(temp_dir: &TempDir) -> CmdRunner {
    let db_path = temp_dir.path().join("nla.db");
    let lock_dir = temp_dir.path().join("locks");
    let mut runner = CmdRunner::new(env!("CARGO_BIN_EXE_nla"));
    runner
        .arg("--db-path")
        .arg(db_path)
        .arg("--lock-dir")
        .arg(lock_dir)
        .arg("--test-mode")
        .capture_stdout();
    runner
}

fn setup_quota(temp_dir: &TempDir) -> TestResult<()> {
    let mut runner = nla_runner(temp_dir);
    let mut cmd = runner
        .args(["quota", "fred", "--create", "--size", "1TiB", "--email", "fred@example.ac.uk"])
        .run();
    let mut output = String::new();
    cmd.stdout().read_to_string(&mut output)?;
    let matches = get_matches(&["created quota for fred"], output)?;
    assert_eq!(matches.len(), 1);
    cmd.wait()?.expect_success();
    Ok(())
}

#[test]
fn test_status_on_fresh_store_passes() -> TestResult<()> {
    let temp_dir = tempdir()?;
    let mut runner = nla_runner(&temp_dir);
    let mut cmd = runner.args(["status"]).run();
    let mut output = String::new();
    cmd.stdout().read_to_string(&mut output)?;

    let patterns = &["UNVERIFIED", "ONTAPE", "RESTORED", "total"];
    let matches = get_matches(patterns, output)?;
    assert_eq!(matches.len(), 4);

    cmd.wait()?.expect_success();
    Ok(())
}

#[test]
fn test_submit_and_list_requests_passes() -> TestResult<()> {
    let temp_dir = tempdir()?;
    setup_quota(&temp_dir)?;

    {
        // a forward-looking pattern request: nothing matches yet
        let mut runner = nla_runner(&temp_dir);
        let mut cmd = runner
            .args([
                "submit",
                "--quota",
                "fred",
                "--pattern",
                "/badc/cira/2025/",
                "--label",
                "cira 2025",
            ])
            .run();
        let mut output = String::new();
        cmd.stdout().read_to_string(&mut output)?;
        let matches = get_matches(&["created request 1"], output)?;
        assert_eq!(matches.len(), 1);
        cmd.wait()?.expect_success();
    }

    {
        // the request shows up in the listing
        let mut runner = nla_runner(&temp_dir);
        let mut cmd = runner.args(["requests"]).run();
        let mut output = String::new();
        cmd.stdout().read_to_string(&mut output)?;
        let patterns = &["cira 2025", "fred", "1 request(s)"];
        let matches = get_matches(patterns, output)?;
        assert_eq!(matches.len(), 3);
        cmd.wait()?.expect_success();
    }

    {
        // detail view falls back to the pattern for the file listing
        let mut runner = nla_runner(&temp_dir);
        let mut cmd = runner.args(["requests", "1"]).run();
        let mut output = String::new();
        cmd.stdout().read_to_string(&mut output)?;
        let matches = get_matches(&["/badc/cira/2025/"], output)?;
        assert!(!matches.is_empty());
        cmd.wait()?.expect_success();
    }

    Ok(())
}

#[test]
fn test_submit_without_quota_fails() -> TestResult<()> {
    let temp_dir = tempdir()?;
    let mut runner = nla_runner(&temp_dir);
    let mut cmd = runner
        .args(["submit", "--quota", "nobody", "--pattern", "/badc/"])
        .run();
    let status = cmd.wait()?;
    assert!(!status.success());
    Ok(())
}

#[test]
fn test_process_deactivates_unmatched_requests_passes() -> TestResult<()> {
    let temp_dir = tempdir()?;
    setup_quota(&temp_dir)?;

    {
        let mut runner = nla_runner(&temp_dir);
        let mut cmd = runner
            .args(["submit", "--quota", "fred", "--pattern", "/badc/cira/2025/"])
            .run();
        cmd.wait()?.expect_success();
    }

    {
        let mut runner = nla_runner(&temp_dir);
        let mut cmd = runner.args(["process"]).run();
        let mut output = String::new();
        cmd.stdout().read_to_string(&mut output)?;
        // one request examined, nothing matches, no slots loaded
        let patterns = &["1 inactive", "0 slot(s) newly loaded"];
        let matches = get_matches(patterns, output)?;
        assert_eq!(matches.len(), 2);
        cmd.wait()?.expect_success();
    }

    Ok(())
}

#[test]
fn test_quota_view_shows_usage_passes() -> TestResult<()> {
    let temp_dir = tempdir()?;
    setup_quota(&temp_dir)?;

    let mut runner = nla_runner(&temp_dir);
    let mut cmd = runner.args(["quota", "fred"]).run();
    let mut output = String::new();
    cmd.stdout().read_to_string(&mut output)?;
    let patterns = &["quota for fred", "1.0 TiB", "fred@example.ac.uk"];
    let matches = get_matches(patterns, output)?;
    assert_eq!(matches.len(), 3);
    cmd.wait()?.expect_success();
    Ok(())
}

#[test]
fn test_disks_add_and_list_passes() -> TestResult<()> {
    let temp_dir = tempdir()?;
    let mountpoint = temp_dir.path().join("restore_1");

    let mut runner = nla_runner(&temp_dir);
    let mut cmd = runner
        .args(["disks", "--add"])
        .arg(&mountpoint)
        .args(["--size", "500GiB"])
        .run();
    let mut output = String::new();
    cmd.stdout().read_to_string(&mut output)?;
    let patterns = &["added restore disk", "500.0 GiB"];
    let matches = get_matches(patterns, output)?;
    assert!(matches.len() >= 2);
    cmd.wait()?.expect_success();
    Ok(())
}

#[test]
fn test_tidy_with_nothing_expired_passes() -> TestResult<()> {
    let temp_dir = tempdir()?;
    let mut runner = nla_runner(&temp_dir);
    let mut cmd = runner.args(["tidy"]).run();
    let mut output = String::new();
    cmd.stdout().read_to_string(&mut output)?;
    let matches = get_matches(&["removed 0 request(s)"], output)?;
    assert_eq!(matches.len(), 1);
    cmd.wait()?.expect_success();
    Ok(())
}

#[test]
fn test_fix_repairs_run_and_report_passes() -> TestResult<()> {
    let temp_dir = tempdir()?;
    let mut runner = nla_runner(&temp_dir);
    let mut cmd = runner
        .args(["fix", "clear-slots", "reset-restoring", "remove-duplicates"])
        .run();
    let mut output = String::new();
    cmd.stdout().read_to_string(&mut output)?;
    let patterns = &[
        "clear-slots: 0 slot(s) cleared",
        "reset-restoring: 0 file(s) back to ONTAPE",
        "remove-duplicates: 0 duplicate row(s) removed",
    ];
    let matches = get_matches(patterns, output)?;
    assert_eq!(matches.len(), 3);
    cmd.wait()?.expect_success();
    Ok(())
}

#[test]
fn test_unknown_fix_fails() -> TestResult<()> {
    let temp_dir = tempdir()?;
    let mut runner = nla_runner(&temp_dir);
    let mut cmd = runner.args(["fix", "no-such-repair"]).run();
    let status = cmd.wait()?;
    assert!(!status.success());
    Ok(())
}
