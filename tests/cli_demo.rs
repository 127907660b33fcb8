use assert_cmd::prelude::*;
use color_eyre::Result;
use std::path::Path;
use std::process::Command;

fn osupgrader(config: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("osupgrader")?;
    cmd.arg("--config").arg(config).env_remove("RUST_LOG");
    Ok(cmd)
}

#[test]
fn test_config_init_and_show() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conf.json");

    let output = osupgrader(&path)?.args(["config", "init"]).output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(path.exists());

    // A second init without --force refuses to overwrite
    let output = osupgrader(&path)?.args(["config", "init"]).output()?;
    assert!(!output.status.success());

    let output = osupgrader(&path)?.args(["config", "show"]).output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"vcenter_url\""));
    assert!(stdout.contains("\"snapshot_name_prefix\": \"pre-upgrade\""));
    assert!(!stdout.contains("\"password\":"));
    Ok(())
}

#[test]
fn test_check_flags_bad_iso_path() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conf.json");
    std::fs::write(
        &path,
        r#"{"defaults": {"iso_datastore_path": "datastore1/windows.img"}}"#,
    )?;

    let output = osupgrader(&path)?.arg("check").output()?;
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("❌ invalid ISO path"), "stdout: {}", stdout);
    Ok(())
}

#[test]
fn test_check_default_config() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conf.json");

    let output = osupgrader(&path)?.arg("check").output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✓ ISO path: [datastore1] iso/windows-server-2022.iso"));
    assert!(stdout.contains("✓ Parallelism: up to 10 workers"));
    Ok(())
}

#[test]
fn test_demo_two_machines() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conf.json");

    let output = osupgrader(&path)?
        .args(["demo", "--machines", "2", "--workers", "2"])
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {}\nstderr: {}", stdout, String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("✓ DONE (srv001)"));
    assert!(stdout.contains("✓ DONE (srv002)"));
    assert!(stdout.contains("2/2 succeeded, 0 failed"));
    Ok(())
}

#[test]
fn test_demo_with_failure_and_manual_check() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conf.json");

    let output = osupgrader(&path)?
        .args([
            "demo",
            "--machines",
            "3",
            "--fail",
            "srv002",
            "--slow-signal",
            "srv003",
        ])
        .output()?;
    assert!(!output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("❌ FAILED (srv002): await-script-exit: upgrade script exited with code 1603"));
    assert!(stdout.contains("⚠ DONE, MANUAL CHECK REQUIRED (srv003)"));
    assert!(stdout.contains("2/3 succeeded, 1 failed"));
    assert!(stdout.contains("  - srv003"));
    Ok(())
}

#[test]
fn test_demo_unknown_datastore_fails_before_any_job() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conf.json");
    std::fs::write(
        &path,
        r#"{"defaults": {"iso_datastore_path": "[nosuch] iso/windows-server-2022.iso"}}"#,
    )?;

    let output = osupgrader(&path)?
        .args(["demo", "--machines", "3"])
        .output()?;
    assert!(!output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("datastore 'nosuch' not found"), "stderr: {}", stderr);
    assert!(!stdout.contains("Upgrading"), "stdout: {}", stdout);
    assert!(!stdout.contains("FAILED"), "stdout: {}", stdout);

    // The same ISO passes once the hypervisor knows the datastore
    let output = osupgrader(&path)?
        .args(["demo", "--machines", "1", "--datastore", "nosuch"])
        .output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    Ok(())
}

#[test]
fn test_snapshots_list_with_filter() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conf.json");

    let output = osupgrader(&path)?
        .args(["snapshots", "--machines", "2", "list"])
        .output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("4 snapshot(s)"), "stdout: {}", stdout);

    let output = osupgrader(&path)?
        .args(["snapshots", "--machines", "2", "list", "--filter", "PRE-UPGRADE-pre-srv002"])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("srv002"));
    assert!(!stdout.contains("srv001"));
    assert!(!stdout.contains("baseline"));
    assert!(stdout.contains("1 snapshot(s)"), "stdout: {}", stdout);
    Ok(())
}

#[test]
fn test_snapshots_remove() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conf.json");

    let output = osupgrader(&path)?
        .args(["snapshots", "--machines", "3", "remove", "baseline", "--workers", "2"])
        .output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✓ REMOVED baseline (srv001)"));
    assert!(stdout.contains("✓ REMOVED baseline (srv003)"));
    assert!(stdout.contains("3/3 removed, 0 failed"));

    let output = osupgrader(&path)?
        .args(["snapshots", "--machines", "2", "remove", "does-not-exist"])
        .output()?;
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("- NOT FOUND does-not-exist (srv002)"));
    assert!(stdout.contains("0/2 removed, 0 failed"));
    Ok(())
}
