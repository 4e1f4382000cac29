//! CLI tests for `virt-ci`: list mode and settings failures.
//!
//! Spawns the binary against a scratch test path. List mode with a whitelist
//! never touches the harness, the tracker or the host.

use std::fs;
use std::process::Command;

use virt_ci::exit_codes;

fn virt_ci() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_virt-ci"));
    for var in ["CI_LIST", "CI_ONLY", "CI_NO", "CI_SMOKE", "CI_SETTINGS", "CI_TEST_PATH"] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn list_prints_short_names_from_whitelist() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("whitelist.test"),
        "# nightly\n\
         type_specific.io-github-autotest-libvirt.virsh.domname.normal\n\
         type_specific.io-github-autotest-libvirt.svirt.start\n",
    )
    .expect("whitelist");

    let out = virt_ci()
        .arg("--list")
        .arg("--white")
        .arg("whitelist.test")
        .arg("--test-path")
        .arg(temp.path())
        .output()
        .expect("virt-ci --list");

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert_eq!(
        String::from_utf8_lossy(&out.stdout),
        "virsh.domname.normal\nsvirt.start\n"
    );
    assert!(temp.path().join("run.test").exists());
    assert!(!temp.path().join("xunit_result.xml").exists());
}

#[test]
fn malformed_settings_fail_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("virt-ci.toml"), "test_timeout_secs = \"soon\"\n")
        .expect("settings");

    let out = virt_ci()
        .arg("--list")
        .arg("--test-path")
        .arg(temp.path())
        .output()
        .expect("virt-ci --list");

    assert_eq!(out.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&out.stderr).contains("virt-ci.toml"));
}

#[test]
fn malformed_pull_id_fails_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = virt_ci()
        .arg("--list")
        .arg("--pull-libvirt")
        .arg("5,abc")
        .arg("--test-path")
        .arg(temp.path())
        .status()
        .expect("virt-ci --list");

    assert_eq!(status.code(), Some(exit_codes::FAILED));
}
